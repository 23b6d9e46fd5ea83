//! Payment processor callbacks.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use tracing::info;

use crate::error::Result;
use crate::services::confirmation::ConfirmationOutcome;
use crate::services::payments::SIGNATURE_HEADER;
use crate::state::AppState;

/// Handle a signed payment event.
///
/// The body is taken raw so the signature is checked over the exact bytes
/// the processor sent. Any 2xx tells the processor to stop redelivering,
/// so a grant that could not be persisted answers 500.
pub async fn payments(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let outcome = state.confirmation().handle(&body, signature).await?;

    match &outcome {
        ConfirmationOutcome::Granted {
            owner,
            product_id,
            outcome,
        } => info!(%owner, %product_id, new = outcome.is_new(), "Payment confirmed"),
        ConfirmationOutcome::Rejected { reason } => info!(%reason, "Payment rejected"),
        ConfirmationOutcome::AlreadyResolved(status) => {
            info!(%status, "Duplicate payment callback");
        }
        ConfirmationOutcome::Ignored { event_type } => {
            tracing::debug!(%event_type, "Payment event ignored");
        }
    }

    Ok(StatusCode::OK)
}
