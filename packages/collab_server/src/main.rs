#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]

mod api;
mod ws;

use std::{
    env,
    sync::{Arc, LazyLock},
};

use actix_cors::Cors;
use actix_web::{App, http, middleware};
use codocs_auth::{DocumentAccess, HttpDocumentAccess, TokenVerifier};
use codocs_session::Registry;
use tokio::try_join;

use crate::api::health_endpoint;

static WS_SERVER_HANDLE: LazyLock<tokio::sync::RwLock<Option<ws::server::CollabServerHandle>>> =
    LazyLock::new(|| tokio::sync::RwLock::new(None));

fn main() -> Result<(), std::io::Error> {
    pretty_env_logger::init();

    let service_port = {
        let args: Vec<String> = env::args().collect();

        if args.len() > 1 {
            args[1].parse::<u16>().expect("Invalid port argument")
        } else {
            default_env_u16("PORT", 8000)
        }
    };

    actix_web::rt::System::with_tokio_rt(|| {
        let threads = default_env_usize("MAX_THREADS", 64);
        log::debug!("Running with {threads} max blocking threads");
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .max_blocking_threads(threads)
            .build()
            .unwrap()
    })
    .block_on(async move {
        let access_token_secret =
            env::var("ACCESS_TOKEN_SECRET").expect("ACCESS_TOKEN_SECRET not set");
        let document_api_host = default_env("DOCUMENT_API_HOST", "http://localhost:8080");
        let service_access_token =
            env::var("SERVICE_ACCESS_TOKEN").expect("SERVICE_ACCESS_TOKEN not set");
        let front_end_url = env::var("FRONT_END_URL").ok();

        let verifier = TokenVerifier::new(&access_token_secret);
        let access: Arc<dyn DocumentAccess> = Arc::new(HttpDocumentAccess::new(
            document_api_host,
            service_access_token,
        ));

        let registry = Arc::new(Registry::new());
        let (ws_server, ws_server_handle) = ws::server::CollabServer::new(registry);
        let ws_server = tokio::spawn(ws_server.run());

        WS_SERVER_HANDLE
            .write()
            .await
            .replace(ws_server_handle.clone());

        let app = move || {
            let cors = front_end_url.as_ref().map_or_else(Cors::permissive, |url| {
                Cors::default()
                    .allowed_origin(url)
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        http::header::AUTHORIZATION,
                        http::header::ACCEPT,
                        http::header::CONTENT_TYPE,
                    ])
                    .supports_credentials()
                    .max_age(3600)
            });

            App::new()
                .wrap(cors)
                .wrap(middleware::Compress::default())
                .app_data(actix_web::web::Data::new(verifier.clone()))
                .app_data(actix_web::web::Data::new(access.clone()))
                .service(health_endpoint)
                .service(api::websocket)
        };

        let mut http_server = actix_web::HttpServer::new(app);

        if let Some(workers) = option_env_usize("ACTIX_WORKERS") {
            log::debug!("Running with {workers} Actix workers");
            http_server = http_server.workers(workers);
        }

        let http_server = http_server
            .bind((default_env("BIND_ADDR", "0.0.0.0"), service_port))?
            .run();

        log::info!("Server listening on port {service_port}...");

        if let Err(err) = try_join!(
            async move {
                let resp = http_server.await;

                log::debug!("Shutting down ws server...");
                ws_server_handle.shutdown();
                WS_SERVER_HANDLE.write().await.take();

                resp
            },
            async move {
                let resp = ws_server.await.expect("Failed to shut down ws server");
                log::debug!("CollabServer connection closed");
                resp
            },
        ) {
            log::error!("Error on shutdown: {err:?}");
            return Err(err);
        }

        log::debug!("Server shut down");

        Ok(())
    })
}

fn default_env(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn default_env_u16(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .map(|x| x.parse::<u16>().expect("Invalid environment variable value"))
        .unwrap_or(default)
}

fn default_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|x| x.parse::<usize>().ok())
        .unwrap_or(default)
}

fn option_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|x| x.parse::<usize>().ok())
}
