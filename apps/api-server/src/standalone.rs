use crate::{config::ServerConfig, routes::get_routes, Ctx};
use ai::CaptionService;
use dotenvy::dotenv;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub async fn start_server() -> anyhow::Result<()> {
    match dotenv() {
        Ok(path) => println!(".env read successfully from {}", path.display()),
        Err(e) => println!("Could not load .env file: {e}"),
    };

    let config = ServerConfig::from_env()?;

    match &config.log_dir {
        Some(log_dir) => analytics_tracing::init_tracing_to_file(log_dir.clone()),
        None => analytics_tracing::init_tracing_to_stdout(),
    }
    tracing::debug!("server config: {:?}", config);

    let provider = ai::git::init_global_provider(config.git.clone())?;
    let caption_service =
        CaptionService::new(provider.clone()).with_inference_timeout(config.inference_timeout);

    if config.preload {
        tokio::spawn(async move {
            match provider.get_model_handle().await {
                Ok(handle) => tracing::info!("model {} preloaded", handle.model_id()),
                Err(e) => tracing::error!("failed to preload model: {}", e),
            }
        });
    }

    let app = get_routes(Ctx::new(caption_service), config.max_upload_bytes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_methods(Any)
                .allow_headers(Any)
                .allow_origin(Any),
        );

    // [::] listens on IPv6 and IPv4
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!("Listening on http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl-C received, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, shutting down...");
        },
    }
}
