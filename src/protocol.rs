//! Wire-level request/response vocabulary.
//!
//! This module is the closed tagged union mentioned in the design notes: a
//! [`Request`] and a [`Response`] are enums keyed by opcode, not a free-form
//! map. [`crate::codec`] is the only place that knows how to turn these into
//! bytes and back.

/// An event, as it travels in `FILTER_EVENTS` responses and in persisted
/// day files. See [`crate::timeseries::Event`] for the store's own copy,
/// which additionally knows its creation order.
#[derive(Debug, Clone, PartialEq)]
pub struct WireEvent {
    pub product: String,
    pub quantity: i32,
    pub price: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Register = 0x01,
    Login = 0x02,
    Logout = 0x03,
    AddEvent = 0x04,
    QuantitySold = 0x05,
    SalesVolume = 0x06,
    AveragePrice = 0x07,
    MaxPrice = 0x08,
    FilterEvents = 0x09,
    SimultaneousSales = 0x0A,
    ConsecutiveSales = 0x0B,
    NewDay = 0x0C,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use Opcode::*;
        Some(match v {
            0x01 => Register,
            0x02 => Login,
            0x03 => Logout,
            0x04 => AddEvent,
            0x05 => QuantitySold,
            0x06 => SalesVolume,
            0x07 => AveragePrice,
            0x08 => MaxPrice,
            0x09 => FilterEvents,
            0x0A => SimultaneousSales,
            0x0B => ConsecutiveSales,
            0x0C => NewDay,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    Error = 0x01,
    AuthFailed = 0x02,
    NotAuthenticated = 0x03,
    UserExists = 0x04,
    InvalidParams = 0x05,
}

impl Status {
    pub fn from_u8(v: u8) -> Option<Self> {
        use Status::*;
        Some(match v {
            0x00 => Ok,
            0x01 => Error,
            0x02 => AuthFailed,
            0x03 => NotAuthenticated,
            0x04 => UserExists,
            0x05 => InvalidParams,
            _ => return None,
        })
    }
}

/// Request body, decoded from the frame that follows `(tag, length)` on the
/// wire. `request_id` is kept only because the wire format carries it; per
/// the design notes it is always `0` from a conforming client and MUST NOT
/// be used for correlation; the frame's outer `tag` is authoritative.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub request_id: i32,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Register { username: String, password: String },
    Login { username: String, password: String },
    Logout,
    AddEvent { product: String, quantity: i32, price: f64 },
    QuantitySold { product: String, days: i32 },
    SalesVolume { product: String, days: i32 },
    AveragePrice { product: String, days: i32 },
    MaxPrice { product: String, days: i32 },
    FilterEvents { products: Option<Vec<String>>, day_offset: i32 },
    SimultaneousSales { product1: String, product2: String },
    ConsecutiveSales { n: i32 },
    NewDay,
}

impl RequestBody {
    pub fn opcode(&self) -> Opcode {
        match self {
            RequestBody::Register { .. } => Opcode::Register,
            RequestBody::Login { .. } => Opcode::Login,
            RequestBody::Logout => Opcode::Logout,
            RequestBody::AddEvent { .. } => Opcode::AddEvent,
            RequestBody::QuantitySold { .. } => Opcode::QuantitySold,
            RequestBody::SalesVolume { .. } => Opcode::SalesVolume,
            RequestBody::AveragePrice { .. } => Opcode::AveragePrice,
            RequestBody::MaxPrice { .. } => Opcode::MaxPrice,
            RequestBody::FilterEvents { .. } => Opcode::FilterEvents,
            RequestBody::SimultaneousSales { .. } => Opcode::SimultaneousSales,
            RequestBody::ConsecutiveSales { .. } => Opcode::ConsecutiveSales,
            RequestBody::NewDay => Opcode::NewDay,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub request_id: i32,
    pub status: Status,
    pub payload: ResponsePayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Empty,
    Error { message: String },
    Quantity { quantity: i32 },
    Revenue { revenue: f64 },
    AvgPrice { avg_price: f64 },
    MaxPrice { max_price: f64 },
    Events { events: Vec<WireEvent> },
    Bool { result: bool },
    Product { product: String },
}

impl Response {
    pub fn ok(request_id: i32, payload: ResponsePayload) -> Self {
        Response { request_id, status: Status::Ok, payload }
    }

    pub fn error(request_id: i32, status: Status, message: impl Into<String>) -> Self {
        Response { request_id, status, payload: ResponsePayload::Error { message: message.into() } }
    }
}
