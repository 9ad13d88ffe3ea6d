// In-process gateway stand-in for tests. Serves canned JSON per
// (method, path) and records every request it sees.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, body::Incoming, service::service_fn};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::{net::TcpListener, task::JoinHandle};

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub body: String,
}

#[derive(Default)]
struct Routes {
    constant: HashMap<(String, String), (u16, String)>,
    queued: HashMap<(String, String), VecDeque<(u16, String)>>,
}

pub struct MockGateway {
    address: SocketAddr,
    routes: Arc<Mutex<Routes>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    accept_task: JoinHandle<()>,
}
impl MockGateway {
    pub async fn start() -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let address = listener.local_addr().unwrap();

        let routes = Arc::new(Mutex::new(Routes::default()));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let accept_routes = routes.clone();
        let accept_requests = requests.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };

                let routes = accept_routes.clone();
                let requests = accept_requests.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |request: Request<Incoming>| {
                        let routes = routes.clone();
                        let requests = requests.clone();
                        async move {
                            Ok::<_, std::convert::Infallible>(
                                handle(&routes, &requests, request).await,
                            )
                        }
                    });

                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            address,
            routes,
            requests,
            accept_task,
        }
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    pub fn stub(
        &self,
        method: &str,
        path: &str,
        status: u16,
        body: &str,
    ) {
        self.routes
            .lock()
            .constant
            .insert((method.to_owned(), path.to_owned()), (status, body.to_owned()));
    }
    pub fn stub_sequence(
        &self,
        method: &str,
        path: &str,
        responses: &[(u16, &str)],
    ) {
        self.routes.lock().queued.insert(
            (method.to_owned(), path.to_owned()),
            responses
                .iter()
                .map(|(status, body)| (*status, (*body).to_owned()))
                .collect(),
        );
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
    pub fn request_count(
        &self,
        method: &str,
        path: &str,
    ) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.method == method && request.path == path)
            .count()
    }
}
impl Drop for MockGateway {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle(
    routes: &Mutex<Routes>,
    requests: &Mutex<Vec<RecordedRequest>>,
    request: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let method = request.method().to_string();
    let path = request.uri().path().to_owned();
    let query = request.uri().query().map(str::to_owned);

    let body = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    requests.lock().push(RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        query,
        body: String::from_utf8_lossy(&body).into_owned(),
    });

    let key = (method, path);
    let (status, payload) = {
        let mut routes = routes.lock();

        let queued = routes
            .queued
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());
        match queued {
            Some(response) => response,
            None => match routes.constant.get(&key) {
                Some(response) => response.clone(),
                None => (404, r#"{"error": "not found"}"#.to_owned()),
            },
        }
    };

    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(payload)))
        .unwrap()
}
