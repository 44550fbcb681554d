pub mod attr_log;
pub mod error;
pub mod file_select;
pub mod file_type;
pub mod ids;
pub mod opref;
pub mod settings;
pub mod summary;
pub mod util;

pub use error::{error_kind, GageError, Violation};
pub use ids::{make_run_id, run_name_for_id, timestamp_uuid};
pub use opref::OpRef;
pub use settings::Settings;
pub use summary::RunSummary;
pub use util::{
    atomic_write_bytes, atomic_write_json_pretty, ensure_dir, files_digest, make_readonly,
    read_trimmed, safe_list_dir, safe_rmtree, sha256_bytes, sha256_file,
};
