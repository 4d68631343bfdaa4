pub mod cache;
pub mod context;
pub mod layout;
pub mod num;
pub mod shape;
pub mod verify;

pub use context::{Context, ContextBuilder, ContextConfig};
pub use layout::{
    BlockedEncoding, CtaLayout, DotOperandEncoding, Encoding, Layout, LayoutError,
    LayoutInterface, MmaEncoding, MmaVersion, ParseError, SharedEncoding, SliceEncoding,
    VoltaStates,
};
pub use num::ScalarType;
pub use verify::{DotVerifier, LayoutVerifier, Operation, OperationState, TensorType, VerifyError};
