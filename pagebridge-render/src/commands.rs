//! Named entry points the sandbox exports to the host.
//!
//! Every action is reachable under two names. The prefixed names exist from
//! the moment the sandbox starts; the direct names only after the first
//! document has loaded, so a host that calls early has to fall back.

use std::collections::HashMap;

use pagebridge_core::protocol::encode;
use pagebridge_core::{
    HostMessage, InvokeError, NavigationAction, NavigationCommand, ScriptTarget, TransportEndpoint,
};
use parking_lot::RwLock;
use tracing::debug;

pub struct CommandTable {
    exports: RwLock<HashMap<&'static str, NavigationAction>>,
    endpoint: TransportEndpoint,
}

impl CommandTable {
    /// Calls are delivered as `command` envelopes on `endpoint`.
    pub fn new(endpoint: TransportEndpoint) -> Self {
        Self {
            exports: RwLock::new(HashMap::new()),
            endpoint,
        }
    }

    pub fn export_fallbacks(&self) {
        self.export(NavigationAction::fallback_entry_point);
    }

    pub fn export_direct(&self) {
        self.export(NavigationAction::entry_point);
    }

    pub fn is_exported(&self, entry_point: &str) -> bool {
        self.exports.read().contains_key(entry_point)
    }

    fn export(&self, name_of: fn(NavigationAction) -> &'static str) {
        let mut exports = self.exports.write();
        for action in NavigationAction::ALL {
            exports.insert(name_of(action), action);
        }
    }
}

impl ScriptTarget for CommandTable {
    fn invoke(&self, entry_point: &str, page_number: Option<i64>) -> Result<(), InvokeError> {
        let action = self
            .exports
            .read()
            .get(entry_point)
            .copied()
            .ok_or_else(|| InvokeError::NotDefined(entry_point.to_owned()))?;
        let command = NavigationCommand {
            action,
            page_number: match action {
                NavigationAction::GoToPage => page_number,
                _ => None,
            },
        };
        let raw = encode(&HostMessage::Command(command))
            .map_err(|err| InvokeError::Encode(err.to_string()))?;
        debug!(entry_point, "invoking exported command");
        self.endpoint.deliver(raw).map_err(|_| InvokeError::Closed)
    }
}
