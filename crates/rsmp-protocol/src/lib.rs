// rsmp-protocol: RSMP message model, record framing and version negotiation.
//
// Every record on the wire is one JSON object carrying `mType = "rSMsg"` and a
// `type` discriminator.  The discriminator is resolved once, at build time,
// into a closed `MessageType`; consumers match on that tag instead of strings.

pub mod codec;
pub mod error;
pub mod items;
pub mod message;
pub mod schema;
pub mod version;

pub use codec::{RecordCodec, RECORD_DELIMITER};
pub use error::{ProtocolError, SchemaError};
pub use items::{
    AlarmReturnValue, CommandArg, CommandReturn, Quality, SiteIdEntry, StatusItem, StatusRef,
    SubscribeItem, VersionEntry,
};
pub use message::{
    format_timestamp, AlarmFields, AlarmKind, Attributes, Direction, Message, MessageType, M_TYPE,
};
pub use schema::{CoreShapeValidator, SchemaSet, SchemaValidator};
pub use version::{compare_versions, negotiate, SUPPORTED_CORE_VERSIONS};
