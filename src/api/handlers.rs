use actix_web::{web, HttpResponse, Responder};
use log::error;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::schema::{ErrorResponse, ReplyRequest};
use crate::settlement::{Account, BusinessError, PendingReply, Raw, Settlement, SettlementError};

/// Data structure for the shared settlement context
pub type SettlementData = web::Data<Settlement>;

/// Request for the tip endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TipRequest {
    pub from_user_id: String,

    pub to_user_id: String,

    /// Amount in raw, as a decimal string
    #[schema(example = "1000000000000000000000000")]
    pub amount: String,

    /// Message to finish once the tip is received
    pub reply: Option<ReplyRequest>,
}

/// Request for the withdrawal endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct WithdrawRequest {
    pub from_user_id: String,

    /// Destination `nano_` address
    pub to_address: String,

    /// Amount in raw, as a decimal string
    pub amount: String,

    pub reply: Option<ReplyRequest>,
}

/// Response for a submitted transfer
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransferResponse {
    /// The send block hash
    pub id: String,

    /// Explorer link for the send block
    pub url: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct AccountResponse {
    pub account: Account,

    pub username: Option<String>,

    /// Payment link for topping up the account
    pub top_up_link: String,

    /// Explorer link for the account
    pub explorer_link: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    /// Confirmed balance in raw
    pub balance: String,

    /// Sent to the account but not yet received, in raw
    pub pending: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ReceiveResponse {
    /// Hashes of the receive blocks created
    pub hashes: Vec<String>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct LinkResponse {
    pub url: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct UsernameRequest {
    pub user_id: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct UsernameResponse {
    pub username: String,
    pub user_id: String,
}

/// Maps settlement failures to HTTP responses
///
/// Business errors are the caller's fault and become 400s; anything else is
/// logged and becomes a 500.
fn error_response(err: SettlementError) -> HttpResponse {
    match err {
        SettlementError::Business(business) => HttpResponse::BadRequest().json(ErrorResponse {
            code: Some(business.code().to_string()),
            error: business.to_string(),
        }),
        other => {
            error!("Request failed: {}", other);
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: other.to_string(),
                code: None,
            })
        }
    }
}

fn parse_amount(amount: &str) -> Result<Raw, SettlementError> {
    amount
        .parse()
        .map_err(|e| BusinessError::InvalidAmount(format!("{}", e)).into())
}

impl From<&ReplyRequest> for PendingReply {
    fn from(reply: &ReplyRequest) -> Self {
        PendingReply {
            chat_id: reply.chat_id.clone(),
            message_id: reply.message_id,
            text: reply.text.clone(),
            text_params: reply.text_params.as_ref().map(|p| p.to_string()),
        }
    }
}

/// Tip another user
///
/// Sends from one custodial account to another. Both accounts are created on
/// first use.
#[utoipa::path(
    post,
    path = "/api/v1/tips",
    request_body = TipRequest,
    responses(
        (status = 200, description = "Tip submitted", body = TransferResponse),
        (status = 400, description = "Invalid amount or insufficient balance", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn tip(settlement: SettlementData, request: web::Json<TipRequest>) -> impl Responder {
    let amount = match parse_amount(&request.amount) {
        Ok(amount) => amount,
        Err(err) => return error_response(err),
    };

    let reply = request.reply.as_ref().map(PendingReply::from);
    match settlement
        .engine
        .tip_user_with_reply(&request.from_user_id, &request.to_user_id, &amount, reply.as_ref())
        .await
    {
        Ok(id) => {
            let url = settlement.engine.get_link_for_block(&id);
            HttpResponse::Ok().json(TransferResponse { id, url })
        }
        Err(err) => error_response(err),
    }
}

/// Withdraw to an external address
#[utoipa::path(
    post,
    path = "/api/v1/withdrawals",
    request_body = WithdrawRequest,
    responses(
        (status = 200, description = "Withdrawal submitted", body = TransferResponse),
        (status = 400, description = "Invalid amount, invalid address or insufficient balance", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn withdraw(settlement: SettlementData, request: web::Json<WithdrawRequest>) -> impl Responder {
    let amount = match parse_amount(&request.amount) {
        Ok(amount) => amount,
        Err(err) => return error_response(err),
    };

    let reply = request.reply.as_ref().map(PendingReply::from);
    match settlement
        .engine
        .withdraw_to_address_with_reply(&request.from_user_id, &request.to_address, &amount, reply.as_ref())
        .await
    {
        Ok(id) => {
            let url = settlement.engine.get_link_for_block(&id);
            HttpResponse::Ok().json(TransferResponse { id, url })
        }
        Err(err) => error_response(err),
    }
}

/// Get a user's account
///
/// Creates the account on first use
#[utoipa::path(
    get,
    path = "/api/v1/accounts/{user_id}",
    params(("user_id" = String, Path, description = "Chat platform user id")),
    responses(
        (status = 200, description = "Account retrieved successfully", body = AccountResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn get_account(settlement: SettlementData, user_id: web::Path<String>) -> impl Responder {
    let account = match settlement.engine.get_account(&user_id).await {
        Ok(account) => account,
        Err(err) => return error_response(err),
    };
    let username = match settlement.usernames.get_username(&user_id) {
        Ok(username) => username,
        Err(err) => return error_response(err.into()),
    };
    let top_up_link = match settlement.engine.get_link_for_top_up(&user_id).await {
        Ok(link) => link,
        Err(err) => return error_response(err),
    };

    HttpResponse::Ok().json(AccountResponse {
        top_up_link,
        explorer_link: settlement.engine.get_link_for_account(&account.address),
        username,
        account,
    })
}

/// Get a user's balance
#[utoipa::path(
    get,
    path = "/api/v1/accounts/{user_id}/balance",
    params(("user_id" = String, Path, description = "Chat platform user id")),
    responses(
        (status = 200, description = "Balance retrieved successfully", body = BalanceResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn get_balance(settlement: SettlementData, user_id: web::Path<String>) -> impl Responder {
    match settlement.engine.get_balance(&user_id).await {
        Ok(balance) => HttpResponse::Ok().json(BalanceResponse {
            balance: balance.balance.to_string(),
            pending: balance.pending.to_string(),
        }),
        Err(err) => error_response(err),
    }
}

/// Receive everything pending for a user now
#[utoipa::path(
    post,
    path = "/api/v1/accounts/{user_id}/receive",
    params(("user_id" = String, Path, description = "Chat platform user id")),
    responses(
        (status = 200, description = "Pending blocks received", body = ReceiveResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn receive_pending(settlement: SettlementData, user_id: web::Path<String>) -> impl Responder {
    match settlement.engine.receive_pending_for_user(&user_id).await {
        Ok(blocks) => HttpResponse::Ok().json(ReceiveResponse {
            hashes: blocks.into_iter().map(|b| b.hash).collect(),
        }),
        Err(err) => error_response(err),
    }
}

/// Get the explorer link of a block
#[utoipa::path(
    get,
    path = "/api/v1/blocks/{hash}/link",
    params(("hash" = String, Path, description = "Block hash")),
    responses(
        (status = 200, description = "Link built", body = LinkResponse)
    )
)]
pub async fn get_block_link(settlement: SettlementData, hash: web::Path<String>) -> impl Responder {
    HttpResponse::Ok().json(LinkResponse {
        url: settlement.engine.get_link_for_block(&hash),
    })
}

/// Assign a username to a user
#[utoipa::path(
    put,
    path = "/api/v1/usernames/{username}",
    params(("username" = String, Path, description = "Chat platform username")),
    request_body = UsernameRequest,
    responses(
        (status = 200, description = "Username saved", body = UsernameResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn put_username(
    settlement: SettlementData,
    username: web::Path<String>,
    request: web::Json<UsernameRequest>,
) -> impl Responder {
    match settlement.usernames.put(&username, &request.user_id) {
        Ok(()) => HttpResponse::Ok().json(UsernameResponse {
            username: username.to_lowercase(),
            user_id: request.user_id.clone(),
        }),
        Err(err) => error_response(err.into()),
    }
}

/// Look up the user behind a username
#[utoipa::path(
    get,
    path = "/api/v1/usernames/{username}",
    params(("username" = String, Path, description = "Chat platform username")),
    responses(
        (status = 200, description = "Username found", body = UsernameResponse),
        (status = 404, description = "Unknown username", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn get_username(settlement: SettlementData, username: web::Path<String>) -> impl Responder {
    match settlement.usernames.get_id(&username) {
        Ok(Some(user_id)) => HttpResponse::Ok().json(UsernameResponse {
            username: username.to_lowercase(),
            user_id,
        }),
        Ok(None) => HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Unknown username: {}", username),
            code: None,
        }),
        Err(err) => error_response(err.into()),
    }
}
