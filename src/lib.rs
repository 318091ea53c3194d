pub mod chunk;
pub mod codec;
pub mod crypto;
pub mod datasink;
pub mod extract;
pub mod lock_order;
pub mod stream;

pub use chunk::{ChunkType, SparseChunk};
pub use codec::CodecId;
pub use datasink::{create, Datasink, DatasinkKind, DatasinkOptions, DsFile, FileStat, SinkError};
pub use extract::{ExtractOptions, ExtractSummary, Extractor};
pub use stream::{Chunk, StreamError, XbReader, XbWriter};
