//! HTTP surface.
//!
//! Every handler answers with JSON. Errors always carry an `error` message and,
//! where there is an underlying cause, a `details` string.

mod advice;
mod analyze;
mod logs;
mod users;

use std::{convert::Infallible, error::Error as StdError, sync::Arc};

use chrono::{NaiveDateTime, Utc};
use log::error;
use serde::Serialize;
use sqlx::SqlitePool;
use warp::{
    filters::body::BodyDeserializeError,
    http::StatusCode,
    reject::{self, Reject},
    reply::Response,
    Filter, Rejection, Reply,
};

use crate::{auth, extraction::RetryPolicy, model::ModelProvider, models::User};

/// JSON bodies larger than this are refused before parsing.
const JSON_BODY_LIMIT: u64 = 64 * 1024;

/// Shared state handed to every handler.
#[derive(Debug, Clone)]
pub struct Context {
    pub pool: SqlitePool,
    pub models: Arc<dyn ModelProvider>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Default, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn with_details(mut self, err: &(dyn StdError + 'static)) -> Self {
        self.details = Some(error_chain(err));
        self
    }
}

/// `err` and all of its sources, joined with `: `.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

fn json_reply<T: Serialize>(status: StatusCode, body: &T) -> Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

fn error_reply(status: StatusCode, body: ErrorBody) -> Response {
    json_reply(status, &body)
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

#[derive(Debug)]
struct Unauthorized(&'static str);

impl Reject for Unauthorized {}

#[derive(Debug)]
struct AuthLookupFailed;

impl Reject for AuthLookupFailed {}

fn with_context(ctx: Context) -> impl Filter<Extract = (Context,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

fn json_body<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: serde::de::DeserializeOwned + Send,
{
    warp::body::content_length_limit(JSON_BODY_LIMIT).and(warp::body::json())
}

async fn resolve_bearer(header: Option<String>, ctx: Context) -> Result<User, Rejection> {
    let header = header.ok_or_else(|| reject::custom(Unauthorized("Missing Authorization header")))?;
    let token = header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| reject::custom(Unauthorized("Invalid Authorization header format")))?;

    match auth::user_for_token(&ctx.pool, token, now()).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(reject::custom(Unauthorized("Invalid or expired token"))),
        Err(err) => {
            error!("Could not resolve bearer token: {}", error_chain(&err));
            Err(reject::custom(AuthLookupFailed))
        }
    }
}

/// Extracts the user behind `Authorization: Bearer <token>`.
fn authenticated(ctx: Context) -> impl Filter<Extract = (User,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(with_context(ctx))
        .and_then(resolve_bearer)
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let (status, message) = if let Some(Unauthorized(message)) = err.find() {
        (StatusCode::UNAUTHORIZED, message.to_string())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(err) = err.find::<BodyDeserializeError>() {
        (
            StatusCode::BAD_REQUEST,
            format!("Invalid request body: {}", error_chain(err)),
        )
    } else if err.find::<reject::PayloadTooLarge>().is_some() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            "Request body is too large".to_string(),
        )
    } else if err.find::<reject::UnsupportedMediaType>().is_some() {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Unsupported content type".to_string(),
        )
    } else if err.find::<reject::MissingHeader>().is_some()
        || err.find::<reject::InvalidHeader>().is_some()
        || err.find::<reject::LengthRequired>().is_some()
    {
        (StatusCode::BAD_REQUEST, "Malformed request".to_string())
    } else if err.find::<reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed".to_string(),
        )
    } else {
        error!("Unhandled rejection: {err:?}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        )
    };

    Ok(error_reply(status, ErrorBody::new(message)))
}

/// The full route tree, with rejections rendered as JSON.
pub fn routes(
    ctx: Context,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone + Send + Sync + 'static {
    logs::routes(ctx.clone())
        .or(analyze::routes(ctx.clone()))
        .or(advice::routes(ctx.clone()))
        .or(users::routes(ctx))
        .recover(handle_rejection)
        .with(warp::log("aquaflux::api"))
}
