mod config;
pub use config::{ChunkSizePolicy, DriverConfig};

pub mod errors;
pub use errors::{Error, Result, StateError};

mod pool;
pub use pool::PartBufferPool;

mod session;
pub use session::{SessionResolver, UploadSession};

mod writer;
pub use writer::{MultipartWriter, WriterState};

mod driver;
pub use driver::{Driver, FileInfo, UrlOptions, DRIVER_NAME};
