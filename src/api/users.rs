use std::convert::Infallible;

use log::{error, info};
use serde::{Deserialize, Serialize};
use warp::{http::StatusCode, reply::Response, Filter, Rejection};

use super::{
    authenticated, error_chain, error_reply, json_body, json_reply, now, with_context, Context,
    ErrorBody,
};
use crate::{auth, models::User};

#[derive(Debug, Deserialize)]
struct Registration {
    #[serde(default)]
    username: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Deserialize)]
struct Credentials {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    #[serde(default)]
    refresh: String,
}

#[derive(Debug, Serialize)]
struct RegisteredUser {
    id: i64,
    username: String,
    email: String,
}

#[derive(Debug, Serialize)]
struct Me {
    message: &'static str,
    user_id: i64,
    username: String,
    email: String,
}

fn auth_failure(err: auth::Error) -> Response {
    error!("{}", error_chain(&err));
    error_reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorBody::new("Could not process the account request").with_details(&err),
    )
}

async fn register(ctx: Context, registration: Registration) -> Result<Response, Infallible> {
    let username = registration.username.trim();
    let email = registration.email.trim();

    for (field, value) in [
        ("username", username),
        ("email", email),
        ("password", registration.password.as_str()),
    ] {
        if value.is_empty() {
            return Ok(error_reply(
                StatusCode::BAD_REQUEST,
                ErrorBody::new(format!("{field} must not be empty")),
            ));
        }
    }

    Ok(
        match auth::register(&ctx.pool, username, email, &registration.password, now()).await {
            Ok(user) => json_reply(
                StatusCode::CREATED,
                &RegisteredUser {
                    id: user.id,
                    username: user.username,
                    email: user.email,
                },
            ),
            Err(auth::Error::UsernameTaken(_)) => error_reply(
                StatusCode::BAD_REQUEST,
                ErrorBody::new("A user with that username already exists."),
            ),
            Err(err) => auth_failure(err),
        },
    )
}

async fn token(ctx: Context, credentials: Credentials) -> Result<Response, Infallible> {
    let username = credentials.username.trim();

    let user = match auth::authenticate(&ctx.pool, username, &credentials.password).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            info!("Rejected login for {username}");
            return Ok(error_reply(
                StatusCode::UNAUTHORIZED,
                ErrorBody::new("No active account found with the given credentials"),
            ));
        }
        Err(err) => return Ok(auth_failure(err)),
    };

    Ok(match auth::issue_token_pair(&ctx.pool, user.id, now()).await {
        Ok(pair) => json_reply(StatusCode::OK, &pair),
        Err(err) => auth_failure(err),
    })
}

async fn refresh(ctx: Context, request: RefreshRequest) -> Result<Response, Infallible> {
    let refresh = request.refresh.trim();
    if refresh.is_empty() {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            ErrorBody::new("refresh must not be empty"),
        ));
    }

    Ok(
        match auth::refresh_access_token(&ctx.pool, refresh, now()).await {
            Ok(Some(token)) => json_reply(StatusCode::OK, &token),
            Ok(None) => error_reply(
                StatusCode::UNAUTHORIZED,
                ErrorBody::new("Token is invalid or expired"),
            ),
            Err(err) => auth_failure(err),
        },
    )
}

async fn me(user: User) -> Result<Response, Infallible> {
    Ok(json_reply(
        StatusCode::OK,
        &Me {
            message: "Only authenticated users can see this message!",
            user_id: user.id,
            username: user.username,
            email: user.email,
        },
    ))
}

pub(super) fn routes(ctx: Context) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    // POST /api/users/register
    let register_route = warp::path!("api" / "users" / "register")
        .and(warp::post())
        .and(with_context(ctx.clone()))
        .and(json_body())
        .and_then(register);

    // POST /api/users/token
    let token_route = warp::path!("api" / "users" / "token")
        .and(warp::post())
        .and(with_context(ctx.clone()))
        .and(json_body())
        .and_then(token);

    // POST /api/users/token/refresh
    let refresh_route = warp::path!("api" / "users" / "token" / "refresh")
        .and(warp::post())
        .and(with_context(ctx.clone()))
        .and(json_body())
        .and_then(refresh);

    // GET /api/users/me
    let me_route = warp::path!("api" / "users" / "me")
        .and(warp::get())
        .and(authenticated(ctx))
        .and_then(me);

    register_route
        .or(token_route)
        .unify()
        .or(refresh_route)
        .unify()
        .or(me_route)
        .unify()
}
