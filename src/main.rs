use dubforge::dub_core::settings::AppSettings;
use dubforge::dub_core::watchdog::{stage_worker_main, STAGE_WORKER_ARG};

fn main() {
    // Stage-worker mode: this same binary re-execs itself to run one pipeline
    // stage in an isolated process. Must be checked before anything heavy.
    if std::env::args().nth(1).as_deref() == Some(STAGE_WORKER_ARG) {
        std::process::exit(stage_worker_main());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = AppSettings::from_env();
    let state = match dubforge::bootstrap(settings) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "startup failed");
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "failed to build runtime");
            std::process::exit(2);
        }
    };

    let exit_code = runtime.block_on(async {
        let engine = state.engine.clone();
        let serve = tokio::spawn(dubforge::api::serve(state));
        tokio::select! {
            result = serve => match result {
                Ok(Ok(())) => 0,
                Ok(Err(err)) => {
                    tracing::error!(error = %format!("{err:#}"), "server failed");
                    2
                }
                Err(err) => {
                    tracing::error!(error = %err, "server task failed");
                    2
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                engine.shutdown();
                0
            }
        }
    });
    std::process::exit(exit_code);
}
