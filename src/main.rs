use combo_kv::{Store, StoreConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("combo-kv demo");
    println!("=============");

    let dir = std::env::temp_dir().join("combo-kv-demo");
    std::fs::create_dir_all(&dir)?;
    let store = Store::open(StoreConfig::new(&dir).migration_threshold(256))?;
    println!("Opened pool at {:?}", store.pool_dir());

    for i in 0..2000u64 {
        store.insert(i, i * i)?;
    }
    println!("Inserted 2000 pairs, store now holds {} entries", store.size());
    println!("(the store has migrated from the small map into the tree by now)");

    for key in [0u64, 42, 1999, 99_999] {
        match store.get(key) {
            Some(value) => println!("  {key}: {value}"),
            None => println!("  {key}: not found"),
        }
    }

    println!("\nFirst 5 pairs from a scan over [100, 200]:");
    for (k, v) in store.scan(100, 200, 5) {
        println!("  {k}: {v}");
    }

    store.close()?;
    println!("\nClosed cleanly.");
    Ok(())
}
