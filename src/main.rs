use std::{process, sync::Arc};

use prescripto::{
    cli,
    config::Settings,
    db::ClinicDb,
    logging,
    registry::IndexStatus,
    server,
    shutdown::{RocketIntake, ShutdownCoordinator, termination_signal},
};
use tokio::sync::watch;

/// Entry point: `serve` (default) or `ensure-collections`.
///
/// Exits with 1 when configuration is invalid or the first connect and
/// bootstrap fail, and with 0 after a graceful shutdown.
#[rocket::main]
async fn main() {
    dotenvy::dotenv().ok();

    let matches = match cli::cli().try_get_matches() {
        Ok(matches) => matches,
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            process::exit(code);
        }
    };
    let settings = Settings::from_matches(&matches);
    logging::init_tracing(&settings.log_level);
    tracing::info!(
        environment = %settings.environment,
        database = %settings.database,
        "starting prescripto"
    );

    let code = match cli::command_name(&matches) {
        cli::ENSURE_COLLECTIONS => ensure_collections(&settings).await,
        _ => serve(settings).await,
    };
    process::exit(code);
}

async fn ensure_collections(settings: &Settings) -> i32 {
    let db = ClinicDb::from_settings(settings);
    let code = match db.ready().await {
        Ok(_) => {
            if let Ok(doctors) = db.doctors() {
                if let IndexStatus::Failed(err) = doctors.accessor().wait_for_indexes().await {
                    tracing::warn!(error = %err, "collections ready but indexes are missing");
                }
            }
            tracing::info!("collections ensured");
            0
        }
        Err(err) => {
            tracing::error!(error = %err, "could not ensure collections");
            1
        }
    };
    db.close().await;
    code
}

async fn serve(settings: Settings) -> i32 {
    let db = Arc::new(ClinicDb::from_settings(&settings));
    if let Err(err) = db.ready().await {
        tracing::error!(error = %err, "startup failed");
        return 1;
    }

    let grace = u32::try_from(settings.shutdown_grace.as_secs()).unwrap_or(u32::MAX);
    let figment = rocket::Config::figment()
        .merge(("port", settings.port))
        .merge(("shutdown.ctrlc", false))
        .merge(("shutdown.signals", Vec::<String>::new()))
        .merge(("shutdown.grace", grace));

    let rocket = match server::build(figment, Arc::clone(&db)) {
        Ok(rocket) => rocket,
        Err(err) => {
            tracing::error!(error = %err, "invalid CORS configuration");
            db.close().await;
            return 1;
        }
    };
    let rocket = match rocket.ignite().await {
        Ok(rocket) => rocket,
        Err(err) => {
            tracing::error!(error = %err, "server failed to start");
            db.close().await;
            return 1;
        }
    };

    let (served_tx, mut served) = watch::channel(None);
    let intake = RocketIntake::new(rocket.shutdown(), served.clone());
    tokio::spawn(async move {
        let outcome = rocket
            .launch()
            .await
            .map(|_| ())
            .map_err(|err| err.to_string());
        served_tx.send_replace(Some(outcome));
    });

    let failed = tokio::select! {
        signal = termination_signal() => {
            tracing::info!(signal, "termination signal received");
            None
        }
        stopped = served.wait_for(Option::is_some) => match stopped.as_deref() {
            Ok(Some(Err(err))) => Some(err.clone()),
            _ => None,
        },
    };
    if let Some(err) = failed {
        tracing::error!(error = %err, "server stopped unexpectedly");
        db.close().await;
        return 1;
    }

    let coordinator = ShutdownCoordinator::new(settings.shutdown_grace);
    let sequence = coordinator.shutdown(&intake, db.manager());
    tokio::pin!(sequence);
    loop {
        tokio::select! {
            code = &mut sequence => break code.unwrap_or(0),
            signal = termination_signal() => {
                tracing::info!(signal, "termination signal received");
                coordinator.shutdown(&intake, db.manager()).await;
            }
        }
    }
}
