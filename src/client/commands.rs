//! Per-protocol command accessors.
//!
//! `client.network().start(json!({"graph": "main"}))` is shorthand for
//! `client.send("network", "start", json!({"graph": "main"}))`. One method is
//! generated for every command the client may send.

use futures::future::BoxFuture;
use serde_json::Value;

use super::FbpClient;
use crate::errors::ClientError;

/// Generate an accessor struct with one method per input command.
macro_rules! protocol_commands {
    ($(#[$meta:meta])* $name:ident, $protocol:literal, [$($command:ident),* $(,)?]) => {
        $(#[$meta])*
        #[derive(Clone, Copy)]
        pub struct $name<'a> {
            pub(crate) client: &'a FbpClient,
        }

        impl<'a> $name<'a> {
            pub(crate) fn new(client: &'a FbpClient) -> Self {
                Self { client }
            }

            /// Protocol these commands belong to.
            pub const PROTOCOL: &'static str = $protocol;

            /// Commands available through this accessor.
            pub const COMMANDS: &'static [&'static str] = &[$(stringify!($command)),*];

            $(
                #[doc = concat!("Send `", $protocol, ":", stringify!($command), "`.")]
                pub fn $command(&self, payload: Value) -> BoxFuture<'static, Result<Value, ClientError>> {
                    self.client.send($protocol, stringify!($command), payload)
                }
            )*
        }
    };
}

protocol_commands!(
    /// Commands of the `runtime` protocol.
    RuntimeCommands,
    "runtime",
    [getruntime, packet]
);

protocol_commands!(
    /// Commands of the `graph` protocol.
    GraphCommands,
    "graph",
    [
        clear,
        addnode,
        removenode,
        renamenode,
        changenode,
        addedge,
        removeedge,
        changeedge,
        addinitial,
        removeinitial,
        addinport,
        removeinport,
        renameinport,
        addoutport,
        removeoutport,
        renameoutport,
        addgroup,
        removegroup,
        renamegroup,
        changegroup,
    ]
);

protocol_commands!(
    /// Commands of the `network` protocol.
    NetworkCommands,
    "network",
    [start, stop, getstatus, persist, debug, edges]
);

protocol_commands!(
    /// Commands of the `component` protocol.
    ComponentCommands,
    "component",
    [list, getsource, source]
);

protocol_commands!(
    /// Commands of the `trace` protocol.
    TraceCommands,
    "trace",
    [start, stop, dump, clear]
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Direction;
    use crate::schema;

    fn assert_covers(protocol: &str, generated: &[&str]) {
        let mut generated: Vec<&str> = generated.to_vec();
        generated.sort_unstable();
        assert_eq!(schema::commands(protocol, Direction::Input), generated, "{protocol}");
    }

    #[test]
    fn test_accessors_cover_the_vocabulary() {
        assert_covers(RuntimeCommands::PROTOCOL, RuntimeCommands::COMMANDS);
        assert_covers(GraphCommands::PROTOCOL, GraphCommands::COMMANDS);
        assert_covers(NetworkCommands::PROTOCOL, NetworkCommands::COMMANDS);
        assert_covers(ComponentCommands::PROTOCOL, ComponentCommands::COMMANDS);
        assert_covers(TraceCommands::PROTOCOL, TraceCommands::COMMANDS);
    }
}
