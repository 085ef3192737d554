pub mod bits;
pub mod buffer;
pub mod comm;
pub mod config;
pub mod error;
pub mod linalg;
pub mod reduce;
pub mod reducer;
pub mod sign;
pub mod sync_reducer;
pub mod tensor;
pub mod timer;
pub mod types;

pub use buffer::{PendingBuffer, TensorBuffer};
pub use comm::{CollectiveGroup, CollectiveHandle, Communicator, LocalMesh, MessageKey, Transport};
pub use config::ReducerConfig;
pub use error::{GradwireError, Result};
pub use reducer::{EmbedExchange, RankSpec, Reducer, ReducerContext, ReducerKind, Selection, SparseSize};
pub use sign::{PackedSigns, SignCompressor};
pub use sync_reducer::SyncReducer;
pub use tensor::Tensor;
pub use timer::Timer;
pub use types::{DataType, Element, Rank};
