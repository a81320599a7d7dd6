use std::convert::Infallible;

use log::error;
use serde::Serialize;
use warp::{http::StatusCode, reply::Response, Filter, Rejection};

use super::{
    authenticated, error_chain, error_reply, json_body, json_reply, with_context, Context,
    ErrorBody,
};
use crate::{
    advice::{self, generate_advice, AdviceRequest},
    models::User,
    store::{self, HISTORY_LIMIT},
};

#[derive(Debug, Serialize)]
struct AdviceResponse {
    message: &'static str,
    advice: String,
}

fn advice_failure(err: &(dyn std::error::Error + 'static)) -> Response {
    error!("{}", error_chain(err));
    error_reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorBody::new("Something went wrong while generating advice.").with_details(err),
    )
}

async fn advise(user: User, ctx: Context, request: AdviceRequest) -> Result<Response, Infallible> {
    let history = match store::recent_for_user(&ctx.pool, user.id, HISTORY_LIMIT).await {
        Ok(history) => history,
        Err(err) => return Ok(advice_failure(&err)),
    };

    Ok(
        match generate_advice(ctx.models.as_ref(), &request, &history).await {
            Ok(advice) => json_reply(
                StatusCode::OK,
                &AdviceResponse {
                    message: "Generated advice.",
                    advice,
                },
            ),
            Err(err @ advice::Error::Configuration(_)) => {
                error!("Advice is not configured: {err}");
                error_reply(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody::new("Gemini API key is not configured.").with_details(&err),
                )
            }
            Err(err) => advice_failure(&err),
        },
    )
}

pub(super) fn routes(ctx: Context) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    // POST /api/generate-advice
    warp::path!("api" / "generate-advice")
        .and(warp::post())
        .and(authenticated(ctx.clone()))
        .and(with_context(ctx))
        .and(json_body())
        .and_then(advise)
}
