//! Per-source signal routing.
//!
//! A [`SignalSource`] carries named signals plus a set of global connections
//! that receive every signal on the source along with its name. Connections
//! are identity-keyed by the `(native_fn, ctx)` pair, so the same dispatcher
//! function can be attached many times with distinct contexts.

use crate::data::EventData;
use crate::object::HostObject;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

/// Context pointer attached to a native connection. Identity-compared with
/// `Arc::ptr_eq`, so the connecting layer must keep one stable context per
/// registration for its whole active lifetime.
pub type NativeCtx = Arc<dyn Any + Send + Sync>;

/// Native callback invoked on dispatch.
pub type NativeSignalFn = fn(&NativeCtx, &mut SignalRelay<'_>);

/// View of an in-flight signal delivery handed to each native callback.
pub struct SignalRelay<'a> {
    signal: &'a str,
    data: &'a Arc<EventData>,
    remove: bool,
}

impl SignalRelay<'_> {
    /// Name of the signal being delivered.
    pub fn signal(&self) -> &str {
        self.signal
    }

    /// Shared payload for this delivery. The `Arc` is dropped when the emit
    /// returns, so borrowed handles derived from it die with the delivery.
    pub fn data(&self) -> &Arc<EventData> {
        self.data
    }

    /// Drops the connection currently being dispatched once it returns.
    pub fn remove_current(&mut self) {
        self.remove = true;
    }
}

struct Connection {
    /// `None` marks a global connection.
    signal: Option<String>,
    func: NativeSignalFn,
    ctx: NativeCtx,
}

impl Connection {
    fn matches(&self, signal: Option<&str>, func: NativeSignalFn, ctx: &NativeCtx) -> bool {
        self.signal.as_deref() == signal
            && std::ptr::fn_addr_eq(self.func, func)
            && Arc::ptr_eq(&self.ctx, ctx)
    }
}

/// One host event-signal source.
pub struct SignalSource {
    name: String,
    connections: Mutex<Vec<Connection>>,
}

impl SignalSource {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connects a native callback to a named signal.
    pub fn connect(&self, signal: &str, func: NativeSignalFn, ctx: NativeCtx) {
        self.connections.lock().push(Connection {
            signal: Some(signal.to_string()),
            func,
            ctx,
        });
    }

    /// Removes the first connection matching the `(signal, func, ctx)`
    /// triple. Returns whether anything was removed.
    pub fn disconnect(&self, signal: &str, func: NativeSignalFn, ctx: &NativeCtx) -> bool {
        self.remove_connection(Some(signal), func, ctx)
    }

    /// Connects a catch-all callback that sees every signal with its name.
    pub fn connect_global(&self, func: NativeSignalFn, ctx: NativeCtx) {
        self.connections.lock().push(Connection {
            signal: None,
            func,
            ctx,
        });
    }

    pub fn disconnect_global(&self, func: NativeSignalFn, ctx: &NativeCtx) -> bool {
        self.remove_connection(None, func, ctx)
    }

    fn remove_connection(
        &self,
        signal: Option<&str>,
        func: NativeSignalFn,
        ctx: &NativeCtx,
    ) -> bool {
        let mut connections = self.connections.lock();
        if let Some(pos) = connections
            .iter()
            .position(|conn| conn.matches(signal, func, ctx))
        {
            connections.remove(pos);
            true
        } else {
            false
        }
    }

    /// Number of live connections, named and global.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Emits a signal: matching named connections first, then global ones.
    ///
    /// The connection list is snapshotted up front and callbacks run outside
    /// the source lock, so a callback may connect or disconnect freely;
    /// changes take effect for the next emit. A callback that calls
    /// [`SignalRelay::remove_current`] is dropped as soon as it returns.
    pub fn emit(&self, signal: &str, data: EventData) {
        let data = Arc::new(data);

        let snapshot: Vec<(NativeSignalFn, NativeCtx, Option<String>)> = {
            let connections = self.connections.lock();
            let named = connections
                .iter()
                .filter(|conn| conn.signal.as_deref() == Some(signal));
            let global = connections.iter().filter(|conn| conn.signal.is_none());
            named
                .chain(global)
                .map(|conn| (conn.func, Arc::clone(&conn.ctx), conn.signal.clone()))
                .collect()
        };

        for (func, ctx, connected_signal) in snapshot {
            let mut relay = SignalRelay {
                signal,
                data: &data,
                remove: false,
            };
            func(&ctx, &mut relay);
            if relay.remove {
                self.remove_connection(connected_signal.as_deref(), func, &ctx);
            }
        }
    }
}

impl HostObject for SignalSource {
    fn kind(&self) -> &'static str {
        "signal_source"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
