use std::{convert::Infallible, path::Path};

use futures_lite::StreamExt;
use log::{error, info, warn};
use serde::Serialize;
use warp::{
    http::StatusCode,
    hyper::body::Buf,
    multipart::{FormData, Part},
    reply::Response,
    Filter, Rejection,
};

use super::{error_chain, error_reply, json_reply, with_context, Context, ErrorBody};
use crate::{
    extraction::{extract_water_data, ExtractionError, Image},
    models::ExtractionResult,
};

pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;
const IMAGE_FIELD: &str = "image";
const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Serialize)]
struct AnalyzeResponse {
    message: &'static str,
    water_data: ExtractionResult,
    image_filename: Option<String>,
    image_size: usize,
}

#[derive(Debug)]
struct Upload {
    filename: Option<String>,
    content_type: String,
    data: Vec<u8>,
}

/// Falls back on the file extension when the part has no content type.
fn guess_content_type(filename: Option<&str>) -> String {
    let extension = filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        Some("heif") => "image/heif",
        _ => OCTET_STREAM,
    }
    .to_string()
}

async fn read_part(part: Part) -> Result<Vec<u8>, warp::Error> {
    let stream = part.stream();
    futures_lite::pin!(stream);

    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(chunk?.chunk());
    }

    Ok(data)
}

/// Finds the `image` field. Other fields are skipped.
async fn read_upload(form: FormData) -> Result<Option<Upload>, warp::Error> {
    futures_lite::pin!(form);

    while let Some(part) = form.next().await {
        let part = part?;
        if part.name() != IMAGE_FIELD {
            continue;
        }

        let filename = part.filename().map(str::to_string);
        let content_type = part
            .content_type()
            .filter(|mime| *mime != OCTET_STREAM)
            .map(str::to_string)
            .unwrap_or_else(|| guess_content_type(filename.as_deref()));
        let data = read_part(part).await?;

        return Ok(Some(Upload {
            filename,
            content_type,
            data,
        }));
    }

    Ok(None)
}

fn extraction_failure(err: ExtractionError) -> Response {
    match &err {
        ExtractionError::Configuration(_) => {
            error!("Image analysis is not configured: {err}");
            error_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::new("Gemini API key is not configured."),
            )
        }
        ExtractionError::Format {
            raw_response,
            source,
            ..
        } => {
            warn!("{}", error_chain(&err));
            error_reply(
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: "Gemini could not extract valid water data as JSON.".to_string(),
                    details: Some(source.to_string()),
                    raw_response: Some(raw_response.clone()),
                },
            )
        }
        ExtractionError::Service { source, .. } => {
            error!("{}", error_chain(&err));
            error_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::new(
                    "There was a problem communicating with the Gemini API. Please try again later.",
                )
                .with_details(source),
            )
        }
    }
}

async fn analyze_image(ctx: Context, form: FormData) -> Result<Response, Infallible> {
    let upload = match read_upload(form).await {
        Ok(Some(upload)) if !upload.data.is_empty() => upload,
        Ok(_) => {
            return Ok(error_reply(
                StatusCode::BAD_REQUEST,
                ErrorBody::new("No image was submitted."),
            ))
        }
        Err(err) => {
            error!("Could not read upload: {}", error_chain(&err));
            return Ok(error_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::new("There was a problem processing the uploaded image.")
                    .with_details(&err),
            ));
        }
    };

    info!(
        "Analyzing {} ({}, {} bytes)",
        upload.filename.as_deref().unwrap_or("unnamed upload"),
        upload.content_type,
        upload.data.len()
    );

    let image_size = upload.data.len();
    let image = Image {
        mime_type: upload.content_type,
        data: upload.data,
    };

    Ok(
        match extract_water_data(ctx.models.as_ref(), image, ctx.retry).await {
            Ok(extraction) => json_reply(
                StatusCode::OK,
                &AnalyzeResponse {
                    message: "Extracted water data from the image.",
                    water_data: extraction.water_data,
                    image_filename: upload.filename,
                    image_size,
                },
            ),
            Err(err) => extraction_failure(err),
        },
    )
}

pub(super) fn routes(ctx: Context) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    // POST /api/analyze-image
    warp::path!("api" / "analyze-image")
        .and(warp::post())
        .and(with_context(ctx))
        .and(warp::multipart::form().max_length(MAX_UPLOAD_BYTES))
        .and_then(analyze_image)
}
