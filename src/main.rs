use postbox::config::Config;
use postbox::pop3::Pop3Server;
use postbox::security::Authenticator;
use postbox::smtp::SmtpServer;
use postbox::storage::{ContentStore, MailStore};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = if std::path::Path::new("config.toml").exists() {
        Config::from_file("config.toml")?
    } else {
        Config::default()
    };

    let level = config
        .logging
        .level
        .parse::<Level>()
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("failed to set tracing subscriber");

    info!("starting postbox");
    info!("  domain: {}", config.server.domain);
    info!("  SMTP on {}", config.smtp.listen_addr);
    info!("  POP3 on {}", config.pop3.listen_addr);
    info!("  database: {}", config.storage.database_url);
    info!("  emails dir: {}", config.storage.emails_dir);

    let store = MailStore::open(&config.storage.database_url).await?;
    let content = ContentStore::new(config.storage.emails_dir.clone());
    content.init().await?;
    let authenticator = Authenticator::new(store.clone())?;

    let smtp = SmtpServer::new(
        &config,
        store.clone(),
        content.clone(),
        Some(authenticator.clone()),
    )?
    .bind()
    .await?;
    let pop3 = Pop3Server::new(&config, store.clone(), content, authenticator)?
        .bind()
        .await?;

    let smtp_shutdown = smtp.shutdown_handle();
    let pop3_shutdown = pop3.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            smtp_shutdown.stop();
            pop3_shutdown.stop();
        }
    });

    let (smtp_result, pop3_result) = tokio::join!(smtp.run(), pop3.run());
    smtp_result?;
    pop3_result?;

    store.close().await;
    info!("postbox stopped");
    Ok(())
}
