use std::fs;
use std::path::Path;

use crate::Result;

pub fn run(base: &Path) -> Result<()> {
    let services_dir = base.join("services");
    let mut removed = 0usize;
    if let Ok(entries) = fs::read_dir(&services_dir) {
        for entry in entries.flatten() {
            let cache = entry.path().join("cache.json");
            if cache.exists() {
                fs::remove_file(&cache)?;
                removed += 1;
            }
        }
    }
    println!("removed {removed} cache file(s)");
    Ok(())
}
