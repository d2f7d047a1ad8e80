//! Static (class, method) to handler table
//!
//! The table is built once from a list of registrations. A duplicate
//! registration is a programming error and panics on first use, which the
//! server forces at construction time.

use crate::error::{Error, Result};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt;
use stun_rs::methods::{ALLOCATE, BINDING, CHANNEL_BIND, CREATE_PERMMISSION, DATA, REFRESH, SEND};
use stun_rs::{MessageClass, MessageMethod};

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl From<&MessageClass> for Class {
    fn from(class: &MessageClass) -> Self {
        match class {
            MessageClass::Request => Class::Request,
            MessageClass::Indication => Class::Indication,
            MessageClass::SuccessResponse => Class::SuccessResponse,
            MessageClass::ErrorResponse => Class::ErrorResponse,
        }
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// STUN/TURN methods known to the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Binding,
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    ChannelBind,
}

impl Method {
    /// Maps a decoded method, `None` for methods the relay does not know
    pub fn from_stun(method: &MessageMethod) -> Option<Self> {
        let known = [
            (BINDING, Method::Binding),
            (ALLOCATE, Method::Allocate),
            (REFRESH, Method::Refresh),
            (SEND, Method::Send),
            (DATA, Method::Data),
            (CREATE_PERMMISSION, Method::CreatePermission),
            (CHANNEL_BIND, Method::ChannelBind),
        ];
        known
            .iter()
            .find(|(stun_method, _)| stun_method == method)
            .map(|(_, method)| *method)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Handler capability selected for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Allocate,
    Refresh,
    CreatePermission,
    ChannelBind,
    Binding,
    SendIndication,
}

const REGISTRATIONS: &[(Class, Method, Handler)] = &[
    (Class::Indication, Method::Send, Handler::SendIndication),
    (Class::Request, Method::Allocate, Handler::Allocate),
    (Class::Request, Method::Refresh, Handler::Refresh),
    (Class::Request, Method::CreatePermission, Handler::CreatePermission),
    (Class::Request, Method::ChannelBind, Handler::ChannelBind),
    (Class::Request, Method::Binding, Handler::Binding),
];

lazy_static! {
    static ref DISPATCHER: Dispatcher = Dispatcher::build(REGISTRATIONS)
        .unwrap_or_else(|e| panic!("invalid dispatch table: {}", e));
}

/// Maps (class, method) to a handler
#[derive(Debug)]
pub struct Dispatcher {
    handlers: HashMap<(Class, Method), Handler>,
}

impl Dispatcher {
    /// The dispatcher shared by every request
    pub fn global() -> &'static Dispatcher {
        &DISPATCHER
    }

    /// Builds a table, rejecting duplicate registrations
    pub fn build(registrations: &[(Class, Method, Handler)]) -> Result<Self> {
        let mut handlers = HashMap::with_capacity(registrations.len());
        for &(class, method, handler) in registrations {
            if handlers.insert((class, method), handler).is_some() {
                return Err(Error::Config(format!(
                    "duplicate handler for {}-{}",
                    method, class
                )));
            }
        }
        Ok(Self { handlers })
    }

    /// Resolves the handler for a decoded message
    pub fn resolve(&self, class: MessageClass, method: MessageMethod) -> Result<Handler> {
        Method::from_stun(&method)
            .and_then(|known| self.handlers.get(&(Class::from(&class), known)))
            .copied()
            .ok_or_else(|| Error::Dispatch {
                class: format!("{:?}", class),
                method: format!("{:?}", method),
            })
    }
}
