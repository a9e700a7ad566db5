// 影片目录模块

pub mod store;
pub mod types;

pub use store::CatalogStore;
pub use types::{
    normalize_link, normalize_title, record_key, DownloadLink, LinkKind, LinkSource, MovieRecord,
    RecordDraft, RecordStatus, StatusUpdate, TaskBinding, UpsertOutcome,
};
