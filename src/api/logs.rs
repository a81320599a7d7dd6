use std::convert::Infallible;

use log::error;
use warp::{http::StatusCode, reply::Response, Filter, Rejection, Reply};

use super::{
    authenticated, error_chain, error_reply, json_body, json_reply, now, with_context, Context,
    ErrorBody,
};
use crate::{
    models::{LogEntryInput, LogEntryPatch, User},
    store,
};

fn store_failure(err: store::Error) -> Response {
    error!("{}", error_chain(&err));
    error_reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorBody::new("Could not access the log store").with_details(&err),
    )
}

fn not_found() -> Response {
    error_reply(StatusCode::NOT_FOUND, ErrorBody::new("Not found"))
}

async fn list(user: User, ctx: Context) -> Result<Response, Infallible> {
    Ok(match store::list_for_user(&ctx.pool, user.id).await {
        Ok(entries) => json_reply(StatusCode::OK, &entries),
        Err(err) => store_failure(err),
    })
}

async fn create(user: User, ctx: Context, input: LogEntryInput) -> Result<Response, Infallible> {
    if let Err(err) = input.validate() {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            ErrorBody::new(err.to_string()),
        ));
    }

    Ok(match store::create(&ctx.pool, user.id, &input, now()).await {
        Ok(entry) => json_reply(StatusCode::CREATED, &entry),
        Err(err) => store_failure(err),
    })
}

async fn retrieve(id: i64, user: User, ctx: Context) -> Result<Response, Infallible> {
    Ok(match store::get_for_user(&ctx.pool, user.id, id).await {
        Ok(Some(entry)) => json_reply(StatusCode::OK, &entry),
        Ok(None) => not_found(),
        Err(err) => store_failure(err),
    })
}

async fn replace(
    id: i64,
    user: User,
    ctx: Context,
    input: LogEntryInput,
) -> Result<Response, Infallible> {
    if let Err(err) = input.validate() {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            ErrorBody::new(err.to_string()),
        ));
    }

    Ok(
        match store::update_for_user(&ctx.pool, user.id, id, &input, now()).await {
            Ok(Some(entry)) => json_reply(StatusCode::OK, &entry),
            Ok(None) => not_found(),
            Err(err) => store_failure(err),
        },
    )
}

async fn patch(
    id: i64,
    user: User,
    ctx: Context,
    changes: LogEntryPatch,
) -> Result<Response, Infallible> {
    let current = match store::get_for_user(&ctx.pool, user.id, id).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return Ok(not_found()),
        Err(err) => return Ok(store_failure(err)),
    };

    replace(id, user, ctx, changes.apply(&current)).await
}

async fn delete(id: i64, user: User, ctx: Context) -> Result<Response, Infallible> {
    Ok(match store::delete_for_user(&ctx.pool, user.id, id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found(),
        Err(err) => store_failure(err),
    })
}

pub(super) fn routes(ctx: Context) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    // GET /api/logs
    let list_route = warp::path!("api" / "logs")
        .and(warp::get())
        .and(authenticated(ctx.clone()))
        .and(with_context(ctx.clone()))
        .and_then(list);

    // POST /api/logs
    let create_route = warp::path!("api" / "logs")
        .and(warp::post())
        .and(authenticated(ctx.clone()))
        .and(with_context(ctx.clone()))
        .and(json_body())
        .and_then(create);

    // GET /api/logs/:id
    let retrieve_route = warp::path!("api" / "logs" / i64)
        .and(warp::get())
        .and(authenticated(ctx.clone()))
        .and(with_context(ctx.clone()))
        .and_then(retrieve);

    // PUT /api/logs/:id
    let replace_route = warp::path!("api" / "logs" / i64)
        .and(warp::put())
        .and(authenticated(ctx.clone()))
        .and(with_context(ctx.clone()))
        .and(json_body())
        .and_then(replace);

    // PATCH /api/logs/:id
    let patch_route = warp::path!("api" / "logs" / i64)
        .and(warp::patch())
        .and(authenticated(ctx.clone()))
        .and(with_context(ctx.clone()))
        .and(json_body())
        .and_then(patch);

    // DELETE /api/logs/:id
    let delete_route = warp::path!("api" / "logs" / i64)
        .and(warp::delete())
        .and(authenticated(ctx.clone()))
        .and(with_context(ctx))
        .and_then(delete);

    list_route
        .or(create_route)
        .unify()
        .or(retrieve_route)
        .unify()
        .or(replace_route)
        .unify()
        .or(patch_route)
        .unify()
        .or(delete_route)
        .unify()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use warp::http::StatusCode;

    use crate::{
        api::{
            routes,
            tests::{body, context, login},
        },
        model::fake::FakeProvider,
    };

    #[tokio::test]
    async fn create_then_list_in_date_order() {
        let ctx = context(FakeProvider::unconfigured()).await;
        let token = login(&ctx, "alice").await;
        let api = routes(ctx);

        for ph in [6.8, 7.2] {
            let response = warp::test::request()
                .method("POST")
                .path("/api/logs")
                .header("authorization", &token)
                .json(&json!({"water_data": {"ph": ph, "kh": null}, "fish_type": "Guppy"}))
                .reply(&api)
                .await;
            assert_eq!(response.status(), StatusCode::CREATED);

            let created = body(&response);
            assert_eq!(created["user_username"], "alice");
            assert_eq!(created["tank_type"], "freshwater");
            assert_eq!(created["water_data"]["kh"], serde_json::Value::Null);
        }

        let response = warp::test::request()
            .path("/api/logs")
            .header("authorization", &token)
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let listed = body(&response);
        let phs: Vec<_> = listed
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["water_data"]["ph"].as_f64().unwrap())
            .collect();
        assert_eq!(phs, vec![7.2, 6.8]);
    }

    #[tokio::test]
    async fn other_users_entries_are_404() {
        let ctx = context(FakeProvider::unconfigured()).await;
        let alice = login(&ctx, "alice").await;
        let bob = login(&ctx, "bob").await;
        let api = routes(ctx);

        let created = warp::test::request()
            .method("POST")
            .path("/api/logs")
            .header("authorization", &alice)
            .json(&json!({"notes": "private"}))
            .reply(&api)
            .await;
        let id = body(&created)["id"].as_i64().unwrap();

        for method in ["GET", "DELETE"] {
            let response = warp::test::request()
                .method(method)
                .path(&format!("/api/logs/{id}"))
                .header("authorization", &bob)
                .reply(&api)
                .await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{method}");
        }

        let response = warp::test::request()
            .method("PUT")
            .path(&format!("/api/logs/{id}"))
            .header("authorization", &bob)
            .json(&json!({"notes": "hijacked"}))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = warp::test::request()
            .path(&format!("/api/logs/{id}"))
            .header("authorization", &alice)
            .reply(&api)
            .await;
        assert_eq!(body(&response)["notes"], "private");
    }

    #[tokio::test]
    async fn put_replaces_and_patch_merges() {
        let ctx = context(FakeProvider::unconfigured()).await;
        let token = login(&ctx, "alice").await;
        let api = routes(ctx);

        let created = warp::test::request()
            .method("POST")
            .path("/api/logs")
            .header("authorization", &token)
            .json(&json!({
                "water_data": {"ph": 7.0},
                "fish_type": "Betta",
                "tank_type": "saltwater",
                "notes": "first"
            }))
            .reply(&api)
            .await;
        let id = body(&created)["id"].as_i64().unwrap();
        let path = format!("/api/logs/{id}");

        let patched = warp::test::request()
            .method("PATCH")
            .path(&path)
            .header("authorization", &token)
            .json(&json!({"notes": "second"}))
            .reply(&api)
            .await;
        assert_eq!(patched.status(), StatusCode::OK);
        let patched = body(&patched);
        assert_eq!(patched["notes"], "second");
        assert_eq!(patched["fish_type"], "Betta");
        assert_eq!(patched["tank_type"], "saltwater");
        assert_eq!(patched["water_data"]["ph"], 7.0);

        let replaced = warp::test::request()
            .method("PUT")
            .path(&path)
            .header("authorization", &token)
            .json(&json!({"water_data": {"no3": 20.0}}))
            .reply(&api)
            .await;
        assert_eq!(replaced.status(), StatusCode::OK);
        let replaced = body(&replaced);
        assert_eq!(replaced["fish_type"], serde_json::Value::Null);
        assert_eq!(replaced["tank_type"], "freshwater");
        assert_eq!(replaced["water_data"], json!({"no3": 20.0}));
        assert_eq!(replaced["log_date"], body(&created)["log_date"]);
    }

    #[tokio::test]
    async fn delete_returns_204_then_404() {
        let ctx = context(FakeProvider::unconfigured()).await;
        let token = login(&ctx, "alice").await;
        let api = routes(ctx);

        let created = warp::test::request()
            .method("POST")
            .path("/api/logs")
            .header("authorization", &token)
            .json(&json!({}))
            .reply(&api)
            .await;
        let path = format!("/api/logs/{}", body(&created)["id"]);

        let deleted = warp::test::request()
            .method("DELETE")
            .path(&path)
            .header("authorization", &token)
            .reply(&api)
            .await;
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let gone = warp::test::request()
            .path(&path)
            .header("authorization", &token)
            .reply(&api)
            .await;
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_input_is_400() {
        let ctx = context(FakeProvider::unconfigured()).await;
        let token = login(&ctx, "alice").await;
        let api = routes(ctx);

        let response = warp::test::request()
            .method("POST")
            .path("/api/logs")
            .header("authorization", &token)
            .json(&json!({"tank_type": "pond"}))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = warp::test::request()
            .method("POST")
            .path("/api/logs")
            .header("authorization", &token)
            .json(&json!({"fish_type": "x".repeat(101)}))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body(&response)["error"],
            "fish_type must be at most 100 characters"
        );
    }
}
