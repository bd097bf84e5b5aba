pub mod service {
    use crate::error::ModelError;
    use crate::model::RandomForest;
    use crate::schemas::{Error, Home, Predict, Prediction};
    use std::path::Path;
    use std::sync::Arc;
    use tracing::{debug, info};

    /// Holds the loaded model; cheap to clone and shared by every connection.
    #[derive(Clone)]
    pub struct Service {
        model: Arc<RandomForest>,
    }

    impl Service {
        pub fn new(model: RandomForest) -> Self {
            Self {
                model: Arc::new(model),
            }
        }

        // 从模型文件创建 Service
        pub fn from_path(model_path: &Path) -> Result<Self, ModelError> {
            let model = RandomForest::load(model_path)?;
            info!(
                estimators = model.n_estimators(),
                features = ?model.feature_names(),
                "model loaded"
            );
            Ok(Self::new(model))
        }

        pub(crate) fn home(&self) -> Home {
            Home {
                message: "Bulk Discount Predictor API".into(),
            }
        }

        pub(crate) fn predict(&self, req: Predict) -> Result<Prediction, Error> {
            let label = self.model.predict(&req.features()).map_err(Error::Model)?;
            debug!(?req, label, "prediction");
            Ok(Prediction {
                bulk_discount_applied: label as i64,
            })
        }
    }
}

use crate::error::Error;
use crate::response::{error, json, Body};
use crate::schemas::{self, Predict};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body as _, Bytes, Incoming};
use hyper::{server::conn::http1, Method, Request, Response, StatusCode};
use hyper_util::{rt::TokioIo, server::graceful::GracefulShutdown};
use service::Service;
use std::{future::Future, net::SocketAddr, pin::Pin, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{error as log_error, info, warn};

/// Largest `/predict` body read into memory.
const MAX_BODY_BYTES: usize = 16 * 1024;
/// Pause after a failed `accept`, so fd exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
/// How long shutdown waits for in-flight requests.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct App(Arc<Service>);

impl hyper::service::Service<Request<Incoming>> for App {
    type Response = Response<Body>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.0.clone();
        Box::pin(async move {
            let method = req.method().clone();
            let path = req.uri().path().to_string();
            let response = route(&service, req).await?;
            info!(%method, %path, status = response.status().as_u16(), "request");
            Ok(response)
        })
    }
}

async fn route(service: &Service, req: Request<Incoming>) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    Ok(match (&method, path.as_str()) {
        (&Method::GET, "/") => json(StatusCode::OK, &service.home()),
        (&Method::POST, "/predict") => {
            let query = req.uri().query().unwrap_or_default().to_string();
            let body = match read_body(req.into_body()).await? {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = ?e, "rejected predict request");
                    return Ok(error(e));
                }
            };
            match parse_predict(&query, &body).and_then(|p| service.predict(p)) {
                Ok(prediction) => json(StatusCode::OK, &prediction),
                Err(e) => {
                    warn!(error = ?e, "rejected predict request");
                    error(e)
                }
            }
        }
        (_, "/") | (_, "/predict") => error(schemas::Error::MethodNotAllowed),
        _ => error(schemas::Error::NotFound),
    })
}

// Reads at most `MAX_BODY_BYTES`; transport errors stay `hyper::Error`.
async fn read_body(body: Incoming) -> Result<Result<Bytes, schemas::Error>, hyper::Error> {
    let too_large = Err(schemas::Error::PayloadTooLarge(MAX_BODY_BYTES));
    if body
        .size_hint()
        .upper()
        .is_some_and(|n| n > MAX_BODY_BYTES as u64)
    {
        return Ok(too_large);
    }
    match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(Ok(collected.to_bytes())),
        Err(e) if e.is::<LengthLimitError>() => Ok(too_large),
        Err(e) => match e.downcast::<hyper::Error>() {
            Ok(e) => Err(*e),
            Err(e) => {
                warn!(error = %e, "failed to read request body");
                Ok(too_large)
            }
        },
    }
}

// Query parameters win; a JSON object body is accepted when there are none.
fn parse_predict(query: &str, body: &[u8]) -> Result<Predict, schemas::Error> {
    if !query.is_empty() || body.iter().all(u8::is_ascii_whitespace) {
        return Predict::from_query(query);
    }
    serde_json::from_slice(body).map_err(|e| {
        if e.is_data() {
            schemas::Error::InvalidParams(e)
        } else {
            schemas::Error::WrongJson(e)
        }
    })
}

/// Acquires the listening socket. An occupied address is an error, never silently reused.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, Error> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| Error::Bind { addr, source })
}

/// Accepts connections until `shutdown` resolves, one task per connection.
/// Requests already in flight are allowed to finish before this returns.
pub async fn serve(
    listener: TcpListener,
    service: Service,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Error> {
    let addr = listener.local_addr()?;
    info!(%addr, "listening");

    let app = App(Arc::new(service));
    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };
        let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), app.clone());
        let conn = graceful.watch(conn);
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                log_error!(%peer, error = ?err, "error serving connection");
            }
        });
    }

    drop(listener);
    info!(%addr, "stopped listening, draining connections");
    if tokio::time::timeout(DRAIN_TIMEOUT, graceful.shutdown())
        .await
        .is_err()
    {
        warn!(%addr, "connections still open after drain timeout");
    }
    Ok(())
}

pub async fn start_infer_service(
    service: Service,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Error> {
    let listener = bind(addr).await?;
    serve(listener, service, shutdown).await
}

#[cfg(test)]
async fn spawn_test_server() -> (
    SocketAddr,
    tokio::sync::oneshot::Sender<()>,
    tokio::task::JoinHandle<Result<(), Error>>,
) {
    let listener = bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let service = Service::new(crate::model::test_forest());
    let handle = tokio::spawn(serve(listener, service, async move {
        let _ = rx.await;
    }));
    (addr, tx, handle)
}

#[tokio::test]
async fn test_home() {
    let (addr, _tx, _handle) = spawn_test_server().await;
    let resp = reqwest::get(format!("http://{addr}/")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let home = resp.json::<schemas::Home>().await.unwrap();
    assert_eq!(home.message, "Bulk Discount Predictor API");
}

#[tokio::test]
async fn test_predict_with_query() {
    let (addr, _tx, _handle) = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!(
            "http://{addr}/predict?unit_price=100&quantity=19&is_pro_customer=1"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let prediction = resp.json::<schemas::Prediction>().await.unwrap();
    assert_eq!(prediction.bulk_discount_applied, 1);

    let resp = client
        .post(format!(
            "http://{addr}/predict?unit_price=100&quantity=19&is_pro_customer=0"
        ))
        .send()
        .await
        .unwrap();
    let prediction = resp.json::<schemas::Prediction>().await.unwrap();
    assert_eq!(prediction.bulk_discount_applied, 0);
}

#[tokio::test]
async fn test_predict_with_json_body() {
    let (addr, _tx, _handle) = spawn_test_server().await;
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/predict"))
        .json(&serde_json::json!({
            "unit_price": 300.0,
            "quantity": 2,
            "is_pro_customer": 1,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let prediction = resp.json::<schemas::Prediction>().await.unwrap();
    assert_eq!(prediction.bulk_discount_applied, 0);
}

#[tokio::test]
async fn test_bad_requests_keep_server_alive() {
    let (addr, _tx, handle) = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/predict?unit_price=abc&quantity=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    let body = resp.json::<serde_json::Value>().await.unwrap();
    assert_eq!(body["status"], 422);

    let resp = client
        .post(format!("http://{addr}/predict"))
        .body("{\"unit_price\":")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("http://{addr}/predict"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);

    let resp = client
        .get(format!("http://{addr}/predict"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 405);

    let resp = client
        .get(format!("http://{addr}/missing"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    assert!(!handle.is_finished());
    let resp = client
        .post(format!(
            "http://{addr}/predict?unit_price=80&quantity=15&is_pro_customer=1"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let (addr, _tx, handle) = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/predict"))
        .body(vec![b' '; MAX_BODY_BYTES + 1])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 413);
    let body = resp.json::<serde_json::Value>().await.unwrap();
    assert_eq!(body["status"], 413);

    // exactly at the limit is still read
    let mut body = br#"{"unit_price":100,"quantity":19,"is_pro_customer":1}"#.to_vec();
    body.resize(MAX_BODY_BYTES, b' ');
    let resp = client
        .post(format!("http://{addr}/predict"))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(!handle.is_finished());
}

#[tokio::test]
async fn test_concurrent_predictions() {
    let (addr, _tx, _handle) = spawn_test_server().await;
    let client = reqwest::Client::new();

    let requests = (0..16)
        .map(|i| {
            let client = client.clone();
            let pro = i % 2;
            tokio::spawn(async move {
                let resp = client
                    .post(format!(
                        "http://{addr}/predict?unit_price=100&quantity=19&is_pro_customer={pro}"
                    ))
                    .send()
                    .await
                    .unwrap();
                assert_eq!(resp.status(), 200);
                let prediction = resp.json::<schemas::Prediction>().await.unwrap();
                (pro, prediction.bulk_discount_applied)
            })
        })
        .collect::<Vec<_>>();
    for request in requests {
        let (pro, applied) = request.await.unwrap();
        assert_eq!(applied, pro);
    }
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_request() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (addr, tx, handle) = spawn_test_server().await;
    let body = br#"{"unit_price":100,"quantity":19,"is_pro_customer":1}"#;
    let head = format!(
        "POST /predict HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\n\r\n",
        body.len()
    );

    // send the head and half the body, then stop the server mid-request
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(&body[..10]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished());

    stream.write_all(&body[10..]).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#""bulk_discount_applied":1"#), "{response}");

    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_second_bind_fails() {
    let (addr, _tx, _handle) = spawn_test_server().await;
    let err = bind(addr).await.unwrap_err();
    assert!(matches!(err, Error::Bind { addr: a, .. } if a == addr));
}

#[tokio::test]
async fn test_shutdown() {
    let (addr, tx, handle) = spawn_test_server().await;
    tx.send(()).unwrap();
    handle.await.unwrap().unwrap();

    // the listener is released once serving stops
    let listener = bind(addr).await.unwrap();
    drop(listener);
}

#[test]
fn test_parse_predict() {
    let p = parse_predict("", b"  ").unwrap_err();
    assert_eq!(p.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let p = parse_predict(
        "",
        br#"{"unit_price": 10, "quantity": 4, "is_pro_customer": 0}"#,
    )
    .unwrap();
    assert_eq!(p.quantity, 4);

    let p = parse_predict("", br#"{"unit_price": "x", "quantity": 4, "is_pro_customer": 0}"#)
        .unwrap_err();
    assert_eq!(p.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let p = parse_predict("", b"[1,").unwrap_err();
    assert_eq!(p.status(), StatusCode::BAD_REQUEST);
}
