pub mod core;
pub mod storage;
pub mod index;
pub mod reader;
pub mod query;
pub mod mvcc;
pub mod xa;

pub use crate::core::config::Config;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::service::{IndexConnection, IndexService};
pub use crate::core::types::{EntityId, Isolation, Mutation};
pub use crate::index::strategy::IndexStrategy;
pub use crate::reader::hits::IndexHits;
pub use crate::xa::{Vote, XaDataSource, XaResource, Xid};

/*
┌──────────────────────────────────────────────────────────────────────────────────────┐
│                              TXINDEX STRUCT ARCHITECTURE                              │
└──────────────────────────────────────────────────────────────────────────────────────┘

┌─────────────────────────────────── SERVICE LAYER ────────────────────────────────────┐
│                                                                                       │
│  ┌──────────────────────────────┐        ┌───────────────────────────────────────┐   │
│  │ struct IndexService          │        │ struct IndexConnection (XaResource)   │   │
│  │ source: Arc<DataSource>      │──────▶│ source: Arc<DataSource>               │   │
│  │ local_xids: Arc<AtomicU64>   │ connect│ tx: Option<IndexTransaction>          │   │
│  └──────────────────────────────┘        └───────────────────┬───────────────────┘   │
│                                                              │                        │
│                                          ┌───────────────────▼───────────────────┐   │
│                                          │ struct IndexTransaction               │   │
│                                          │ state: Active → Prepared → Committed  │   │
│                                          │ overlays: HashMap<key, KeyOverlay>    │   │
│                                          │ fulltext: HashMap<key, Fulltext..>    │   │
│                                          │ commands: Vec<Command>                │   │
│                                          └───────────────────┬───────────────────┘   │
└──────────────────────────────────────────────────────────────┼────────────────────────┘
                                                               │ prepare / commit
┌─────────────────────────────────── DATA SOURCE ──────────────▼────────────────────────┐
│                                                                                        │
│  struct DataSource (XaDataSource)                                                      │
│  ├─ metadata: MetadataStore      index.meta   24 bytes: creation, random id, version   │
│  ├─ log: LogicalLog              index.log    Start/Command/Prepare/Commit/Done        │
│  ├─ cache: ReadCache             per key LRU  value → Vec<EntityId>                    │
│  ├─ recovery: RecoveryState      pooled IndexWriters until recovery_complete           │
│  └─ keys: HashMap<key, Arc<KeyIndex>>                                                   │
│        │                                                                               │
│        ▼                                                                               │
│  struct KeyIndex                 keys/<encoded key>/   (tantivy segment files)         │
│  ├─ write_lock: Mutex<()>        serializes writers of the key                         │
│  └─ slot: RwLock<Slot>           IndexHandle + Arc<SearcherRef> + generation           │
│                                                  │                                     │
│                                                  ▼                                     │
│                                  struct SearcherRef   ref_count, detached, closed      │
│                                  struct SearcherCheckout  ──▶  IndexHits (lazy)        │
└────────────────────────────────────────────────────────────────────────────────────────┘

COMMIT FLOW
1. IndexTransaction::prepare    → LogicalLog::begin + prepare (fsync)
2. DataSource::commit           → lock touched keys in key order
3.                              → LogicalLog::commit (fsync), tx number assigned
4.                              → per key: IndexWriter delete/add, commit, KeyIndex::refresh
5.                              → ReadCache::invalidate touched values
6.                              → LogicalLog::done, rotate when large and idle
*/
