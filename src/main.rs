use std::sync::Arc;

use actix_files::NamedFile;
use actix_web::{
    dev::{fn_service, ServiceRequest, ServiceResponse},
    http::Method,
    middleware,
    web::Data,
    App, HttpResponse, HttpServer,
};
use log::info;
use sqlx::SqlitePool;

mod auth;
mod config;
mod db;
mod errors;
mod mailer;
mod routes;
mod structs;
mod tenant;
#[cfg(test)]
mod testing;
mod utils;
mod validation;

use auth::JwtKeys;
use config::Settings;
use mailer::{LogEmailSender, Mailer};
use tenant::TenantPools;

#[derive(Clone)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub tenants: TenantPools,
    pub jwt: JwtKeys,
    pub mailer: Mailer,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let settings = Settings::from_env().map_err(|e| {
        log::error!("FATAL: {}", e);
        e
    })?;

    let db_pool = db::connect_master(&settings.database_url).await?;

    let state = AppState {
        db_pool,
        tenants: TenantPools::new(&settings.tenant_data_dir),
        jwt: JwtKeys::from_settings(&settings),
        mailer: Mailer::new(Arc::new(LogEmailSender), settings.app_url.clone()),
    };

    let static_dir = settings.static_dir.clone();
    info!(
        "Starting HTTP server on http://{}:{}/",
        settings.bind_addr, settings.port
    );

    HttpServer::new(move || {
        App::new()
            // enable automatic response compression - usually register this first
            .wrap(middleware::Compress::default())
            // enable logger - always register Actix Web Logger middleware last
            .wrap(middleware::Logger::default())
            .app_data(Data::new(state.clone()))
            .configure(routes::configure)
            .service(spa_files(&static_dir))
    })
    .bind((settings.bind_addr.as_str(), settings.port))?
    .run()
    .await
}

/// Serves the frontend bundle; unknown GET paths fall back to `index.html`
/// so client-side routes survive a reload.
fn spa_files(static_dir: &std::path::Path) -> actix_files::Files {
    let index = static_dir.join("index.html");
    actix_files::Files::new("/", static_dir)
        .index_file("index.html")
        .default_handler(fn_service(move |req: ServiceRequest| {
            let index = index.clone();
            async move {
                let (req, _) = req.into_parts();
                let resp = match (req.method(), NamedFile::open_async(&index).await) {
                    (&Method::GET, Ok(file)) => file.into_response(&req),
                    (&Method::GET, Err(_)) => HttpResponse::NotFound().json(serde_json::json!({
                        "success": false,
                        "message": "Not found"
                    })),
                    _ => HttpResponse::MethodNotAllowed().finish(),
                };
                Ok::<_, actix_web::Error>(ServiceResponse::new(req, resp))
            }
        }))
}
