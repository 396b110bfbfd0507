//! A distributed Linda tuplespace runtime: processes scattered across nodes
//! coordinate through shared, content-addressed tuplespaces rather than
//! direct messages. See each module for the component it implements.

pub mod config;
pub mod container;
pub mod deadlock;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod gc;
pub mod ids;
pub mod mesh;
pub mod multiplexer;
pub mod node;
pub mod registry;
pub mod value;
pub mod wire;

pub use error::{Result, TsMeshError};
pub use ids::{HolderId, NodeId, ProcessId, ThreadId, TupleSpaceId};
pub use node::Node;
pub use value::{Class, Element, Template, Tuple};
