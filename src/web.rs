// Minimal HTTP server on a tokio listener; one task per connection, JSON
// responses only. Heavy lifting lives in the api handlers.

use crate::api::{parse_http_request, send_http_response, ApiRouter, HttpResponse};
use log::{debug, error, info};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

pub async fn start_server(
    port: u16,
    api_router: ApiRouter,
    web_log: bool,
    shutdown_notify: Arc<tokio::sync::Notify>,
) -> Result<(), anyhow::Error> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {}", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let api_router = api_router.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, api_router, web_log).await {
                                error!("Error handling connection: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown_notify.notified() => {
                info!("Web server received shutdown signal, stopping");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    mut stream: TcpStream,
    api_router: ApiRouter,
    web_log: bool,
) -> Result<(), anyhow::Error> {
    let mut buffer = [0u8; 4096];
    let n = stream.read(&mut buffer).await?;

    let request = match parse_http_request(&buffer[..n]) {
        Ok(req) => req,
        Err(e) => {
            debug!("Failed to parse HTTP request: {}", e);
            let response = HttpResponse::bad_request("malformed request");
            send_http_response(&mut stream, &response).await?;
            return Ok(());
        }
    };

    let response = match api_router.route_request(&request).await {
        Ok(resp) => resp,
        Err(e) => {
            error!("Error handling {} {}: {}", request.method, request.path, e);
            HttpResponse::error(500, "Internal Server Error".to_string())
        }
    };

    if web_log {
        info!("{} {} -> {}", request.method, request.path, response.status);
    } else {
        debug!("{} {} -> {}", request.method, request.path, response.status);
    }

    send_http_response(&mut stream, &response).await?;
    Ok(())
}
