use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/tips", web::post().to(handlers::tip))
            .route("/withdrawals", web::post().to(handlers::withdraw))
            .route("/accounts/{user_id}", web::get().to(handlers::get_account))
            .route("/accounts/{user_id}/balance", web::get().to(handlers::get_balance))
            .route("/accounts/{user_id}/receive", web::post().to(handlers::receive_pending))
            .route("/blocks/{hash}/link", web::get().to(handlers::get_block_link))
            .route("/usernames/{username}", web::put().to(handlers::put_username))
            .route("/usernames/{username}", web::get().to(handlers::get_username))
    );
}
