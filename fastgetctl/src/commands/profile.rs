use std::path::Path;

use fastget_core::{load_profile, save_profile, Profile, ServicePaths, ServiceRegistry};

use crate::{AppError, ProfileArgs, Result};

pub fn run(base: &Path, args: &ProfileArgs) -> Result<()> {
    let registry = ServiceRegistry::load(&base.join("utils/settings/services.json"))?;
    let entry = registry.by_alias(&args.service).ok_or_else(|| {
        AppError::MissingResource(format!("unknown service {}", args.service))
    })?;
    let path = ServicePaths::new(base, &entry.name).profile();

    // Keep a cached token if one exists; only the credentials change.
    let mut profile = load_profile(&path)?.unwrap_or_else(Profile::default);
    profile.username = Some(args.username.clone());
    profile.password = Some(args.password.clone());
    save_profile(&path, &profile)?;
    println!("credentials stored in {}", path.display());
    Ok(())
}
