//! Server-side connection handler (C7): one dedicated reader thread per
//! accepted TCP connection that frames requests off the wire and hands
//! each one to the worker pool as an independent task, plus the shared
//! per-connection writer mutex that keeps response frames from
//! interleaving.
use std::io::{self, BufReader};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{info, warn};

use crate::auth::AuthStore;
use crate::cache::AggregationCache;
use crate::codec;
use crate::error::{AuthError, TimeSeriesError};
use crate::persistence::PersistenceStore;
use crate::protocol::{Request, RequestBody, Response, ResponsePayload, Status};
use crate::timeseries::TimeSeriesStore;
use crate::workerpool::WorkerPool;

pub struct AppState {
    pub auth: Arc<AuthStore>,
    pub ts: Arc<TimeSeriesStore>,
    pub cache: Arc<AggregationCache>,
    pub persistence: Arc<PersistenceStore>,
    pub pool: Arc<WorkerPool>,
}

impl AppState {
    /// Persists users and the current rotation state. Called on the
    /// admin `save` command and on graceful shutdown; individual day
    /// files are saved by the rotation protocol itself.
    pub fn save(&self) -> Result<(), crate::error::PersistenceError> {
        self.persistence.save_users(&self.auth.all_users())?;
        self.persistence.update_state(self.ts.current_day_id())
    }
}

/// Connection-scoped state shared across every task spawned for one
/// connection: which user (if any) is logged in, and the write half of
/// the socket, serialized so concurrent handlers never interleave frames.
struct ConnectionState {
    authenticated_user: Mutex<Option<String>>,
    writer: Mutex<TcpStream>,
}

/// Blocking accept loop. Exits once `shutdown` is set and the next accept
/// wakes up (a short read timeout on the listener keeps that wakeup
/// bounded instead of hanging on a slow client population).
pub fn serve(listener: TcpListener, state: Arc<AppState>, shutdown: Arc<AtomicBool>) -> io::Result<()> {
    for incoming in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match incoming {
            Ok(stream) => {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, state) {
                        warn!(error = %e, "connection closed with error");
                    }
                });
            }
            Err(e) => warn!(error = %e, "accept error"),
        }
    }
    Ok(())
}

fn handle_connection(stream: TcpStream, state: Arc<AppState>) -> io::Result<()> {
    stream.set_nodelay(true).ok();
    let peer = stream.peer_addr().ok();
    info!(?peer, "connection accepted");
    let writer = stream.try_clone()?;
    let conn = Arc::new(ConnectionState {
        authenticated_user: Mutex::new(None),
        writer: Mutex::new(writer),
    });
    let mut reader = BufReader::new(stream);
    loop {
        match codec::read_frame(&mut reader) {
            Ok(Some((tag, body))) => {
                let state = Arc::clone(&state);
                let conn = Arc::clone(&conn);
                state.pool.execute(move || dispatch(tag, &body, &state, &conn));
            }
            Ok(None) => break,
            Err(e) => {
                warn!(?peer, error = %e, "read error, closing connection");
                break;
            }
        }
    }
    info!(?peer, "connection closed");
    Ok(())
}

fn dispatch(tag: i32, body: &[u8], state: &AppState, conn: &ConnectionState) {
    let response = match codec::decode_request(body) {
        Ok(req) => handle_request(req, state, conn),
        Err(e) => Response::error(0, Status::Error, format!("malformed request: {e}")),
    };
    let bytes = codec::encode_response(&response);
    let mut writer = conn.writer.lock().unwrap();
    if let Err(e) = codec::write_frame(&mut *writer, tag, &bytes) {
        warn!(error = %e, "failed to write response frame");
    }
}

fn handle_request(req: Request, state: &AppState, conn: &ConnectionState) -> Response {
    let id = req.request_id;
    match req.body {
        RequestBody::Register { username, password } => match state.auth.register(&username, &password) {
            Ok(()) => Response::ok(id, ResponsePayload::Empty),
            Err(AuthError::AlreadyExists(_)) => Response::error(id, Status::UserExists, "user already exists"),
            Err(e) => Response::error(id, Status::InvalidParams, e.to_string()),
        },
        RequestBody::Login { username, password } => match state.auth.authenticate(&username, &password) {
            Ok(()) => {
                *conn.authenticated_user.lock().unwrap() = Some(username.trim().to_string());
                Response::ok(id, ResponsePayload::Empty)
            }
            Err(_) => Response::error(id, Status::AuthFailed, "authentication failed"),
        },
        RequestBody::Logout => {
            *conn.authenticated_user.lock().unwrap() = None;
            Response::ok(id, ResponsePayload::Empty)
        }
        other => {
            let authenticated = conn.authenticated_user.lock().unwrap().is_some();
            if !authenticated {
                return Response::error(id, Status::NotAuthenticated, "not authenticated");
            }
            handle_authenticated(id, other, state)
        }
    }
}

fn handle_authenticated(id: i32, body: RequestBody, state: &AppState) -> Response {
    match body {
        RequestBody::AddEvent { product, quantity, price } => {
            if product.trim().is_empty() || quantity < 0 || price < 0.0 {
                return Response::error(id, Status::InvalidParams, "invalid event parameters");
            }
            match state.ts.add_event(&product, quantity, price) {
                Ok(()) => Response::ok(id, ResponsePayload::Empty),
                Err(e) => Response::error(id, Status::Error, e.to_string()),
            }
        }
        RequestBody::QuantitySold { product, days } => match validate_days(id, days) {
            Some(err) => err,
            None => match state.cache.aggregate_quantity(&state.ts, &product, days) {
                Ok(quantity) => Response::ok(id, ResponsePayload::Quantity { quantity }),
                Err(e) => insufficient_or_error(id, e),
            },
        },
        RequestBody::SalesVolume { product, days } => match validate_days(id, days) {
            Some(err) => err,
            None => match state.cache.aggregate_revenue(&state.ts, &product, days) {
                Ok(revenue) => Response::ok(id, ResponsePayload::Revenue { revenue }),
                Err(e) => insufficient_or_error(id, e),
            },
        },
        RequestBody::AveragePrice { product, days } => match validate_days(id, days) {
            Some(err) => err,
            None => match state.cache.aggregate_average_price(&state.ts, &product, days) {
                Ok(avg_price) => Response::ok(id, ResponsePayload::AvgPrice { avg_price }),
                Err(e) => insufficient_or_error(id, e),
            },
        },
        RequestBody::MaxPrice { product, days } => match validate_days(id, days) {
            Some(err) => err,
            None => match state.cache.aggregate_max_price(&state.ts, &product, days) {
                Ok(max_price) => Response::ok(id, ResponsePayload::MaxPrice { max_price }),
                Err(e) => insufficient_or_error(id, e),
            },
        },
        RequestBody::FilterEvents { products, day_offset } => {
            let events = state.ts.get_filtered_events(products.as_deref(), day_offset);
            let events = events
                .into_iter()
                .map(|e| crate::protocol::WireEvent {
                    product: e.product,
                    quantity: e.quantity,
                    price: e.price,
                    timestamp: e.timestamp,
                })
                .collect();
            Response::ok(id, ResponsePayload::Events { events })
        }
        RequestBody::SimultaneousSales { product1, product2 } => {
            if product1.trim().is_empty() || product2.trim().is_empty() {
                return Response::error(id, Status::InvalidParams, "product names must not be empty");
            }
            let result = state.ts.wait_for_simultaneous_sales(&product1, &product2);
            Response::ok(id, ResponsePayload::Bool { result })
        }
        RequestBody::ConsecutiveSales { n } => {
            if n < 1 {
                return Response::error(id, Status::InvalidParams, "n must be >= 1");
            }
            let product = state.ts.wait_for_consecutive_sales(n).unwrap_or_default();
            Response::ok(id, ResponsePayload::Product { product })
        }
        RequestBody::NewDay => match state.ts.new_day() {
            Ok(()) => Response::ok(id, ResponsePayload::Empty),
            Err(e) => Response::error(id, Status::Error, e.to_string()),
        },
        RequestBody::Register { .. } | RequestBody::Login { .. } | RequestBody::Logout => {
            unreachable!("auth ops are handled in handle_request before reaching here")
        }
    }
}

fn validate_days(id: i32, days: i32) -> Option<Response> {
    if days < 0 {
        Some(Response::error(id, Status::InvalidParams, "days must be >= 0"))
    } else {
        None
    }
}

fn insufficient_or_error(id: i32, err: TimeSeriesError) -> Response {
    match err {
        TimeSeriesError::InsufficientData => Response::error(id, Status::Error, "Dados insuficientes"),
        other => Response::error(id, Status::Error, other.to_string()),
    }
}
