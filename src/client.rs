//! Client-side demultiplexer (C8).
//!
//! Lets many application threads share one TCP connection and issue
//! concurrent in-flight requests, including long-blocking ones, without
//! blocking each other. A single background reader thread demultiplexes
//! response frames by tag; each caller waits on its own condition
//! variable, all bound to the one mutex guarding the pending-request map
//! (the same "one mutex, several condvars" shape the server's
//! time-series store variant would use if it needed per-key waiters:
//! `Entry::cvar` is the per-tag condition, `map` is the shared lock).
use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufReader};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::codec;
use crate::protocol::{Request, RequestBody, Response};

#[derive(Debug, Clone)]
pub struct ClientError(pub String);

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ClientError {}

struct Entry {
    cvar: Arc<Condvar>,
    result: Option<Result<Vec<u8>, String>>,
}

pub struct Client {
    next_tag: Mutex<i32>,
    send_lock: Mutex<TcpStream>,
    map: Mutex<HashMap<i32, Entry>>,
    broken: Mutex<Option<String>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Arc<Self>> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();
        let read_half = stream.try_clone()?;
        let client = Arc::new(Client {
            next_tag: Mutex::new(0),
            send_lock: Mutex::new(stream),
            map: Mutex::new(HashMap::new()),
            broken: Mutex::new(None),
            reader: Mutex::new(None),
        });
        let reader_client = Arc::clone(&client);
        let handle = thread::spawn(move || reader_client.reader_loop(read_half));
        *client.reader.lock().unwrap() = Some(handle);
        Ok(client)
    }

    fn reader_loop(&self, stream: TcpStream) {
        let mut reader = BufReader::new(stream);
        loop {
            match codec::read_frame(&mut reader) {
                Ok(Some((tag, body))) => {
                    let mut map = self.map.lock().unwrap();
                    if let Some(entry) = map.get_mut(&tag) {
                        entry.result = Some(Ok(body));
                        entry.cvar.notify_all();
                    }
                }
                Ok(None) => {
                    self.fail_all("server closed the connection");
                    break;
                }
                Err(e) => {
                    self.fail_all(&e.to_string());
                    break;
                }
            }
        }
    }

    /// Records the fatal I/O error and wakes every pending caller with it.
    /// This is what lets a connection drop cancel outstanding requests.
    fn fail_all(&self, message: &str) {
        *self.broken.lock().unwrap() = Some(message.to_string());
        let mut map = self.map.lock().unwrap();
        for entry in map.values_mut() {
            entry.result = Some(Err(message.to_string()));
            entry.cvar.notify_all();
        }
    }

    fn allocate_tag(&self) -> i32 {
        let mut next = self.next_tag.lock().unwrap();
        let tag = *next;
        *next = next.wrapping_add(1);
        tag
    }

    /// Sends a pre-encoded request body and blocks the calling thread
    /// (not the connection, not other callers) until the matching
    /// response frame arrives.
    pub fn send(&self, body: &[u8]) -> Result<Vec<u8>, ClientError> {
        if let Some(msg) = self.broken.lock().unwrap().clone() {
            return Err(ClientError(msg));
        }

        let tag = self.allocate_tag();
        {
            let mut map = self.map.lock().unwrap();
            map.insert(tag, Entry { cvar: Arc::new(Condvar::new()), result: None });
        }

        {
            let mut writer = self.send_lock.lock().unwrap();
            if let Err(e) = codec::write_frame(&mut *writer, tag, body) {
                self.map.lock().unwrap().remove(&tag);
                return Err(ClientError(e.to_string()));
            }
        }

        let mut map = self.map.lock().unwrap();
        loop {
            let cvar = match map.get(&tag) {
                Some(entry) if entry.result.is_some() => break,
                Some(entry) => Arc::clone(&entry.cvar),
                None => unreachable!("entry removed while still awaited"),
            };
            map = cvar.wait(map).unwrap();
        }
        let entry = map.remove(&tag).expect("entry present after wait");
        drop(map);
        entry.result.unwrap().map_err(ClientError)
    }

    /// Convenience wrapper: encodes `body` as a `Request`, sends it, and
    /// decodes the matching `Response`.
    pub fn call(&self, body: RequestBody) -> Result<Response, ClientError> {
        let opcode = body.opcode();
        let bytes = codec::encode_request(&Request { request_id: 0, body });
        let response_bytes = self.send(&bytes)?;
        codec::decode_response(&response_bytes, opcode).map_err(|e| ClientError(e.to_string()))
    }
}
