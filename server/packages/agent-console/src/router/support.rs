use super::*;
use agent_console_runner::ImageSource;
use base64::Engine;

pub(super) async fn not_found() -> Response {
    let problem = ProblemDetails {
        type_: ErrorType::InvalidRequest.as_urn().to_string(),
        title: "Not Found".to_string(),
        status: 404,
        detail: Some("endpoint not found".to_string()),
        instance: None,
        extensions: serde_json::Map::new(),
    };

    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "application/problem+json")],
        Json(problem),
    )
        .into_response()
}

/// Checks each attachment is an image with well-formed base64 before it is
/// handed to the agent.
pub(super) fn decode_images(images: Vec<ImageInput>) -> Result<Vec<ImageSource>, ConsoleError> {
    images
        .into_iter()
        .enumerate()
        .map(|(index, image)| {
            if !image.media_type.starts_with("image/") {
                return Err(ConsoleError::InvalidRequest {
                    message: format!(
                        "images[{index}]: unsupported media type {}",
                        image.media_type
                    ),
                });
            }
            base64::engine::general_purpose::STANDARD
                .decode(image.data.as_bytes())
                .map_err(|err| ConsoleError::InvalidRequest {
                    message: format!("images[{index}]: invalid base64 data: {err}"),
                })?;
            Ok(ImageSource::base64(image.media_type, image.data))
        })
        .collect()
}
