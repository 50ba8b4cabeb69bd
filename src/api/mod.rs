// API module
//
// HTTP surface over the settlement engine, for the chat layer

pub mod handlers;
pub mod routes;
pub mod schema;

use utoipa::OpenApi;

pub use routes::configure_routes;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::tip,
        handlers::withdraw,
        handlers::get_account,
        handlers::get_balance,
        handlers::receive_pending,
        handlers::get_block_link,
        handlers::put_username,
        handlers::get_username
    ),
    components(
        schemas(
            crate::settlement::Account,
            crate::settlement::Address,
            schema::ErrorResponse,
            schema::ReplyRequest,
            handlers::TipRequest,
            handlers::WithdrawRequest,
            handlers::TransferResponse,
            handlers::AccountResponse,
            handlers::BalanceResponse,
            handlers::ReceiveResponse,
            handlers::LinkResponse,
            handlers::UsernameRequest,
            handlers::UsernameResponse
        )
    ),
    tags(
        (name = "settlement", description = "Custodial tip settlement endpoints")
    ),
    info(
        title = "Tip Settlement API",
        version = "0.1.0",
        description = "Tips, withdrawals and top-ups between chat users on the Nano ledger",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
pub struct ApiDoc;
