//! The process-wide default client, mirroring the original library's
//! static `mb_default_client` and its free-function shorthand (`mb_register`,
//! `mb_request_pages`, ...). Per the design notes (§9), this is an explicit
//! library-owned instance behind a lock rather than raw process-global
//! state: its lifetime is tied to whichever thread registers it first.

use std::sync::{Mutex, OnceLock};

use membroker_proto::{Message, Opcode};

use crate::client::ClientHandle;
use crate::error::ClientError;

static DEFAULT: OnceLock<Mutex<Option<ClientHandle>>> = OnceLock::new();

fn slot() -> &'static Mutex<Option<ClientHandle>> {
    DEFAULT.get_or_init(|| Mutex::new(None))
}

/// Registers the calling process (by pid) as the default client and
/// installs it as the process-wide default, replacing any prior one.
pub fn register(id: i32, bidi: bool) -> Result<(), ClientError> {
    let client = ClientHandle::register(id, bidi, 0)?;
    *slot().lock().unwrap() = Some(client);
    Ok(())
}

/// Registers the calling process as the default source with `donation`
/// pages advertised.
pub fn register_source(id: i32, donation: i32) -> Result<(), ClientError> {
    let client = ClientHandle::register_source(id, donation)?;
    *slot().lock().unwrap() = Some(client);
    Ok(())
}

fn with_default<T>(f: impl FnOnce(&mut ClientHandle) -> Result<T, ClientError>) -> Result<T, ClientError> {
    let mut guard = slot().lock().unwrap();
    let client = guard.as_mut().ok_or(ClientError::NotConnected)?;
    f(client)
}

pub fn request_pages(n: i32) -> Result<i32, ClientError> {
    with_default(|c| c.request_pages(n))
}

pub fn reserve_pages(n: i32) -> Result<i32, ClientError> {
    with_default(|c| c.reserve_pages(n))
}

pub fn return_pages(n: i32) -> Result<(), ClientError> {
    with_default(|c| c.return_pages(n))
}

pub fn status() -> Result<(), ClientError> {
    with_default(|c| c.status())
}

pub fn query_server() -> Result<i32, ClientError> {
    with_default(|c| c.query_server())
}

pub fn query_total() -> Result<i32, ClientError> {
    with_default(|c| c.query_total())
}

/// This handle's own locally-tracked balance; see [`ClientHandle::balance`].
pub fn query() -> Result<i32, ClientError> {
    with_default(|c| Ok(c.balance()))
}

pub fn send(opcode: Opcode, param: i32) -> Result<(), ClientError> {
    with_default(|c| c.send(opcode, param))
}

pub fn recv() -> Result<Message, ClientError> {
    with_default(|c| c.recv())
}

/// Terminates the default client's registration and drops it, so a later
/// call to [`register`]/[`register_source`] starts fresh.
pub fn terminate() -> Result<(), ClientError> {
    let client = slot()
        .lock()
        .unwrap()
        .take()
        .ok_or(ClientError::NotConnected)?;
    client.terminate()
}
