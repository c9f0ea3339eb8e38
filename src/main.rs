use chat_relay::logging::{init_tracing, setup_panic_hook};
use chat_relay::session::spawn_sweeper;
use chat_relay::{app_router, AppState, Args};
use clap::Parser;
use futures_util::FutureExt;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _guards = init_tracing(args.log_dir.as_deref());
    setup_panic_hook();

    let state = match AppState::new(args.clone()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    let sweeper = spawn_sweeper(state.sessions.clone(), args.sweep_interval());

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("Chat relay listening on {}", addr);

    let app = app_router(state);
    let server_future = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    };

    match std::panic::AssertUnwindSafe(server_future)
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => tracing::info!("Server stopped"),
        Ok(Err(e)) => tracing::error!("Server error: {}", e),
        Err(panic_payload) => {
            let message = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                *s
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.as_str()
            } else {
                "Unknown panic"
            };
            tracing::error!(target: "panic", "CRITICAL: Server task panicked: {}", message);
        }
    }
    sweeper.abort();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
