use tabrelay_core::{Config, Paths};

pub async fn run(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config_path = paths.config_file();

    if config_path.exists() && !force {
        println!("Config already exists at {}", config_path.display());
        println!("Use --force to overwrite.");
        return Ok(());
    }

    Config::default().save(&config_path)?;
    println!("✓ Wrote {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Start Chrome with --remote-debugging-port=9222");
    println!("  2. tabrelay bridge");
    println!("  3. tabrelay agent --attach-all");
    Ok(())
}
