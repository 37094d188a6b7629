use crate::state::AppState;
use crate::websocket::serve_peer;
use actix_web::{get, web, Error, HttpRequest, HttpResponse};

/// Upgrade and hand the connection to the peer bridge.
#[get("/websocket")]
pub async fn ws_handler(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let (response, session, messages) = actix_ws::handle(&req, body)?;
    let messages = messages.max_frame_size(state.peer_settings.max_frame_size);

    actix_web::rt::spawn(serve_peer(
        session,
        messages,
        state.hub.clone(),
        state.admission.clone(),
        state.peer_settings.clone(),
        state.shutdown.clone(),
    ));

    Ok(response)
}
