/// Invalid configuration, reported once while an engine or link is being built.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum ConfigurationError {
    #[display("{field} must be greater than zero")]
    ZeroInterval { field: &'static str },
    #[display("initial poll delay ({initial_ms} ms) must be shorter than the poll interval ({interval_ms} ms)")]
    InitialDelayTooLong { initial_ms: u64, interval_ms: u64 },
    #[display("transaction id range {first}..={last} has no usable value")]
    TransactionRange { first: u16, last: u16 },
    #[display("link '{link}' references unknown transport '{transport}'")]
    UnknownTransport { link: String, transport: String },
    #[display("duplicate name '{name}'")]
    DuplicateName { name: String },
    #[display("link '{link}' reads zero registers")]
    EmptyRead { link: String },
    #[display("no links configured")]
    NoLinks,
}
