use std::path::Path;

use fastget_core::{RegistryEntry, ServiceRegistry};

use crate::{AppError, Result, ServiceInfoArgs};

pub fn run(base: &Path, args: &ServiceInfoArgs) -> Result<()> {
    let registry = ServiceRegistry::load(&base.join("utils/settings/services.json"))?;
    match &args.service {
        Some(alias) => {
            let entry = registry.by_alias(alias).ok_or_else(|| {
                AppError::MissingResource(format!("unknown service {alias}"))
            })?;
            print_entry(entry);
        }
        None => {
            for entry in registry.entries() {
                print_entry(entry);
                println!();
            }
        }
    }
    Ok(())
}

fn print_entry(entry: &RegistryEntry) {
    println!("{}", entry.name);
    println!("  aliases: {}", entry.alias.join(", "));
    println!("  hosts:   {}", entry.hosts.join(", "));
    if let Some(api) = &entry.api {
        println!("  api:     {api}");
    }
    if let Some(config) = &entry.config {
        println!("  config:  {config}");
    }
    if let Some(profile) = &entry.profile {
        println!("  profile: {profile}");
    }
    if let Some(cookies) = &entry.cookies {
        println!("  cookies: {cookies}");
    }
}
