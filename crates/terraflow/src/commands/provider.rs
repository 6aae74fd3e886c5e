//! terraflow provider

use colored::Colorize;
use terraflow_cloud::{SharedProvider, SharedProviderConfig};

/// Start the configured plugin and keep it alive until Ctrl-C
pub async fn handle() -> anyhow::Result<()> {
    let config = terraflow_config::load()?;
    let plugin = config
        .provider
        .native_plugin
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("No provider.native_plugin configured"))?;

    let shared = SharedProviderConfig::new(&plugin.path, &config.provider.source)
        .with_args(plugin.args.clone())
        .with_reattach_timeout(plugin.reattach_timeout())
        .with_protocol_version(plugin.protocol_version);
    let provider = SharedProvider::new(shared)?;

    eprintln!(
        "{} {}",
        "Starting provider plugin".blue(),
        plugin.path.display()
    );
    let reattach = provider.start_shared().await?;
    let (key, value) = reattach.env();

    println!("export {}='{}'", key, value);
    eprintln!(
        "{}",
        format!("✓ Provider running (pid {}). Press Ctrl-C to stop.", reattach.pid)
            .green()
            .bold()
    );

    tokio::signal::ctrl_c().await?;
    provider.stop().await;
    eprintln!("{}", "Provider stopped".dimmed());
    Ok(())
}
