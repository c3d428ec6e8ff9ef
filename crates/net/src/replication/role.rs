/// Which side of the replication link a manager sits on. The two roles
/// share storage and differ in the operations they expose.
pub trait Role: Send + 'static {
    const NAME: &'static str;
}

/// Authoritative: creates entities and emits their changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Server;

/// Mirrors what a server sends.
#[derive(Debug, Clone, Copy, Default)]
pub struct Client;

impl Role for Server {
    const NAME: &'static str = "server";
}

impl Role for Client {
    const NAME: &'static str = "client";
}
