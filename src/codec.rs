//! Length-prefixed frame codec (C1).
//!
//! Two layers:
//! - [`write_frame`]/[`read_frame`]: the outer `(tag, length, body)` framing
//!   shared by requests and responses, used by both the server's connection
//!   handler and the client demultiplexer's reader thread.
//! - [`encode_request`]/[`decode_request`]/[`encode_response`]/[`decode_response`]:
//!   the body codec, a closed tagged union keyed by opcode (or status, for
//!   responses). This is the single place that knows a payload's shape.
//!
//! All integers are big-endian. Strings are `int32 len | UTF-8 bytes`.
//! Event lists use the dictionary-compressed encoding described in the
//! header comment of [`encode_event_list`].
use std::io::{self, Read, Write};

use crate::error::ProtocolError;
use crate::protocol::{Opcode, Request, RequestBody, Response, ResponsePayload, Status, WireEvent};

// ---------------------------------------------------------------------
// Outer framing: int32 tag | int32 bodyLen | bodyLen bytes
// ---------------------------------------------------------------------

pub fn write_frame<W: Write>(w: &mut W, tag: i32, body: &[u8]) -> io::Result<()> {
    w.write_all(&tag.to_be_bytes())?;
    w.write_all(&(body.len() as i32).to_be_bytes())?;
    w.write_all(body)?;
    w.flush()
}

/// Reads one `(tag, body)` frame. Returns `Ok(None)` on a clean EOF before
/// any byte of the next frame has been read (the "no more requests" case);
/// any other truncation is an error.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Option<(i32, Vec<u8>)>> {
    let mut tag_buf = [0u8; 4];
    match r.read_exact(&mut tag_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let tag = i32::from_be_bytes(tag_buf);
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = i32::from_be_bytes(len_buf);
    if len < 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "negative frame length"));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)?;
    Ok(Some((tag, body)))
}

// ---------------------------------------------------------------------
// Primitive writers
// ---------------------------------------------------------------------

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Writer { buf: Vec::with_capacity(64) }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    fn i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn string(&mut self, s: &str) {
        self.i32(s.len() as i32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn string_list(&mut self, items: &[String]) {
        self.i32(items.len() as i32);
        for s in items {
            self.string(s);
        }
    }

    /// Dictionary-compressed event list. `None` encodes as `dictSize = -1`.
    fn event_list(&mut self, events: Option<&[WireEvent]>) {
        let events = match events {
            None => {
                self.i32(-1);
                return;
            }
            Some(e) => e,
        };
        // Build the product dictionary, preserving first-seen order.
        let mut dict: Vec<&str> = Vec::new();
        let mut index_of = |product: &str, dict: &mut Vec<&str>| -> usize {
            if let Some(pos) = dict.iter().position(|p| *p == product) {
                pos
            } else {
                dict.push(product);
                dict.len() - 1
            }
        };
        let mut indices = Vec::with_capacity(events.len());
        for ev in events {
            indices.push(index_of(&ev.product, &mut dict));
        }
        self.i32(dict.len() as i32);
        for p in &dict {
            self.string(p);
        }
        self.i32(events.len() as i32);
        for (ev, idx) in events.iter().zip(indices) {
            self.i16(idx as i16);
            self.i32(ev.quantity);
            self.f64(ev.price);
            self.i64(ev.timestamp);
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

// ---------------------------------------------------------------------
// Primitive readers
// ---------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.pos + n > self.buf.len() {
            return Err(ProtocolError::Truncated);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.u8()? != 0)
    }

    fn i16(&mut self) -> Result<i16, ProtocolError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, ProtocolError> {
        let b = self.take(8)?;
        let mut tmp = [0u8; 8];
        tmp.copy_from_slice(b);
        Ok(i64::from_be_bytes(tmp))
    }

    fn f64(&mut self) -> Result<f64, ProtocolError> {
        let b = self.take(8)?;
        let mut tmp = [0u8; 8];
        tmp.copy_from_slice(b);
        Ok(f64::from_be_bytes(tmp))
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.i32()?;
        if len < 0 {
            return Err(ProtocolError::Truncated);
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn string_list(&mut self) -> Result<Vec<String>, ProtocolError> {
        let count = self.i32()?;
        if count < 0 {
            return Err(ProtocolError::Truncated);
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(self.string()?);
        }
        Ok(out)
    }

    fn event_list(&mut self) -> Result<Option<Vec<WireEvent>>, ProtocolError> {
        let dict_size = self.i32()?;
        if dict_size < 0 {
            return Ok(None);
        }
        let mut dict = Vec::with_capacity(dict_size as usize);
        for _ in 0..dict_size {
            dict.push(self.string()?);
        }
        let count = self.i32()?;
        if count < 0 {
            return Err(ProtocolError::Truncated);
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let idx = self.i16()?;
            let quantity = self.i32()?;
            let price = self.f64()?;
            let timestamp = self.i64()?;
            let product = dict
                .get(idx as usize)
                .cloned()
                .ok_or(ProtocolError::Truncated)?;
            out.push(WireEvent { product, quantity, price, timestamp });
        }
        Ok(Some(out))
    }
}

// ---------------------------------------------------------------------
// Request / Response (de)serialization
// ---------------------------------------------------------------------

pub fn encode_request(req: &Request) -> Vec<u8> {
    let mut w = Writer::new();
    // The wire spec mandates the inner id be written as zero; correlation
    // is by the outer frame tag only (see design notes).
    w.i32(0);
    match &req.body {
        RequestBody::Register { username, password } => {
            w.u8(Opcode::Register as u8);
            w.string(username);
            w.string(password);
        }
        RequestBody::Login { username, password } => {
            w.u8(Opcode::Login as u8);
            w.string(username);
            w.string(password);
        }
        RequestBody::Logout => {
            w.u8(Opcode::Logout as u8);
        }
        RequestBody::AddEvent { product, quantity, price } => {
            w.u8(Opcode::AddEvent as u8);
            w.string(product);
            w.i32(*quantity);
            w.f64(*price);
        }
        RequestBody::QuantitySold { product, days } => {
            w.u8(Opcode::QuantitySold as u8);
            w.string(product);
            w.i32(*days);
        }
        RequestBody::SalesVolume { product, days } => {
            w.u8(Opcode::SalesVolume as u8);
            w.string(product);
            w.i32(*days);
        }
        RequestBody::AveragePrice { product, days } => {
            w.u8(Opcode::AveragePrice as u8);
            w.string(product);
            w.i32(*days);
        }
        RequestBody::MaxPrice { product, days } => {
            w.u8(Opcode::MaxPrice as u8);
            w.string(product);
            w.i32(*days);
        }
        RequestBody::FilterEvents { products, day_offset } => {
            w.u8(Opcode::FilterEvents as u8);
            match products {
                Some(p) => {
                    w.bool(true);
                    w.string_list(p);
                }
                None => w.bool(false),
            }
            w.i32(*day_offset);
        }
        RequestBody::SimultaneousSales { product1, product2 } => {
            w.u8(Opcode::SimultaneousSales as u8);
            w.string(product1);
            w.string(product2);
        }
        RequestBody::ConsecutiveSales { n } => {
            w.u8(Opcode::ConsecutiveSales as u8);
            w.i32(*n);
        }
        RequestBody::NewDay => {
            w.u8(Opcode::NewDay as u8);
        }
    }
    w.into_bytes()
}

pub fn decode_request(body: &[u8]) -> Result<Request, ProtocolError> {
    let mut r = Reader::new(body);
    let request_id = r.i32()?;
    let opcode_byte = r.u8()?;
    let opcode = Opcode::from_u8(opcode_byte).ok_or(ProtocolError::UnknownOpcode(opcode_byte))?;
    let body = match opcode {
        Opcode::Register => RequestBody::Register { username: r.string()?, password: r.string()? },
        Opcode::Login => RequestBody::Login { username: r.string()?, password: r.string()? },
        Opcode::Logout => RequestBody::Logout,
        Opcode::AddEvent => RequestBody::AddEvent {
            product: r.string()?,
            quantity: r.i32()?,
            price: r.f64()?,
        },
        Opcode::QuantitySold => RequestBody::QuantitySold { product: r.string()?, days: r.i32()? },
        Opcode::SalesVolume => RequestBody::SalesVolume { product: r.string()?, days: r.i32()? },
        Opcode::AveragePrice => RequestBody::AveragePrice { product: r.string()?, days: r.i32()? },
        Opcode::MaxPrice => RequestBody::MaxPrice { product: r.string()?, days: r.i32()? },
        Opcode::FilterEvents => {
            let has_products = r.bool()?;
            let products = if has_products { Some(r.string_list()?) } else { None };
            let day_offset = r.i32()?;
            RequestBody::FilterEvents { products, day_offset }
        }
        Opcode::SimultaneousSales => RequestBody::SimultaneousSales {
            product1: r.string()?,
            product2: r.string()?,
        },
        Opcode::ConsecutiveSales => RequestBody::ConsecutiveSales { n: r.i32()? },
        Opcode::NewDay => RequestBody::NewDay,
    };
    Ok(Request { request_id, body })
}

pub fn encode_response(resp: &Response) -> Vec<u8> {
    let mut w = Writer::new();
    w.i32(resp.request_id);
    w.u8(resp.status as u8);
    match &resp.payload {
        ResponsePayload::Empty => {}
        ResponsePayload::Error { message } => w.string(message),
        ResponsePayload::Quantity { quantity } => w.i32(*quantity),
        ResponsePayload::Revenue { revenue } => w.f64(*revenue),
        ResponsePayload::AvgPrice { avg_price } => w.f64(*avg_price),
        ResponsePayload::MaxPrice { max_price } => w.f64(*max_price),
        ResponsePayload::Events { events } => w.event_list(Some(events)),
        ResponsePayload::Bool { result } => w.bool(*result),
        ResponsePayload::Product { product } => w.string(product),
    }
    w.into_bytes()
}

pub fn decode_response(body: &[u8], opcode: Opcode) -> Result<Response, ProtocolError> {
    let mut r = Reader::new(body);
    let request_id = r.i32()?;
    let status_byte = r.u8()?;
    let status = Status::from_u8(status_byte).ok_or(ProtocolError::Truncated)?;
    if status != Status::Ok {
        let message = r.string()?;
        return Ok(Response { request_id, status, payload: ResponsePayload::Error { message } });
    }
    let payload = match opcode {
        Opcode::Register | Opcode::Login | Opcode::Logout | Opcode::AddEvent | Opcode::NewDay => {
            ResponsePayload::Empty
        }
        Opcode::QuantitySold => ResponsePayload::Quantity { quantity: r.i32()? },
        Opcode::SalesVolume => ResponsePayload::Revenue { revenue: r.f64()? },
        Opcode::AveragePrice => ResponsePayload::AvgPrice { avg_price: r.f64()? },
        Opcode::MaxPrice => ResponsePayload::MaxPrice { max_price: r.f64()? },
        Opcode::FilterEvents => {
            let events = r.event_list()?.unwrap_or_default();
            ResponsePayload::Events { events }
        }
        Opcode::SimultaneousSales => ResponsePayload::Bool { result: r.bool()? },
        Opcode::ConsecutiveSales => ResponsePayload::Product { product: r.string()? },
    };
    Ok(Response { request_id, status, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 42, b"hello").unwrap();
        let mut cursor = &buf[..];
        let (tag, body) = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(tag, 42);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn read_frame_clean_eof() {
        let buf: Vec<u8> = Vec::new();
        let mut cursor = &buf[..];
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn add_event_round_trip() {
        let req = Request {
            request_id: 0,
            body: RequestBody::AddEvent { product: "apple".into(), quantity: 3, price: 2.5 },
        };
        let bytes = encode_request(&req);
        let decoded = decode_request(&bytes).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn filter_events_null_products_round_trip() {
        let req = Request {
            request_id: 0,
            body: RequestBody::FilterEvents { products: None, day_offset: 1 },
        };
        let bytes = encode_request(&req);
        let decoded = decode_request(&bytes).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn filter_events_with_products_round_trip() {
        let req = Request {
            request_id: 0,
            body: RequestBody::FilterEvents {
                products: Some(vec!["apple".into(), "banana".into()]),
                day_offset: 0,
            },
        };
        let bytes = encode_request(&req);
        let decoded = decode_request(&bytes).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn event_list_dictionary_shares_repeated_products() {
        let events = vec![
            WireEvent { product: "apple".into(), quantity: 1, price: 1.0, timestamp: 10 },
            WireEvent { product: "banana".into(), quantity: 2, price: 2.0, timestamp: 20 },
            WireEvent { product: "apple".into(), quantity: 3, price: 3.0, timestamp: 30 },
        ];
        let resp = Response::ok(7, ResponsePayload::Events { events: events.clone() });
        let bytes = encode_response(&resp);
        let decoded = decode_response(&bytes, Opcode::FilterEvents).unwrap();
        match decoded.payload {
            ResponsePayload::Events { events: got } => assert_eq!(got, events),
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn error_response_round_trip() {
        let resp = Response::error(3, Status::InvalidParams, "Dados insuficientes");
        let bytes = encode_response(&resp);
        let decoded = decode_response(&bytes, Opcode::QuantitySold).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn simultaneous_sales_bool_payload_round_trip() {
        let resp = Response::ok(1, ResponsePayload::Bool { result: true });
        let bytes = encode_response(&resp);
        let decoded = decode_response(&bytes, Opcode::SimultaneousSales).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn consecutive_sales_empty_product_round_trip() {
        let resp = Response::ok(1, ResponsePayload::Product { product: String::new() });
        let bytes = encode_response(&resp);
        let decoded = decode_response(&bytes, Opcode::ConsecutiveSales).unwrap();
        assert_eq!(decoded, resp);
    }
}
