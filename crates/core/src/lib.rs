pub mod audit;
pub mod clock;
pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod gateway;
pub mod lifecycle;
pub mod rate_limit;
pub mod retry;

pub use audit::{
    AuditHealthSnapshot, AuditLogEntry, AuditSink, AuditWriter, AuditWriterConfig, InMemoryAuditSink,
    TracingAuditGateway,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{allowed_in, classify, ChannelOrigin};
pub use domain::conversation::{ContextType, Conversation, ConversationId, ConversationKey};
pub use domain::task::{NewTask, Task, TaskFilter, TaskId, TaskPriority, TaskStatus};
pub use domain::time_entry::{NewTimeEntry, TimeEntry, TimeEntryId, TimeEntryStart};
pub use domain::user::{Language, PlatformIdentity, User, UserId, UserPreferences};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use gateway::{
    AuditGateway, ConversationGateway, GatewayError, TaskGateway, TimeEntryGateway, UserGateway,
};
pub use lifecycle::{TaskLifecycleManager, TaskUpdate, TimeEntryLifecycleManager};
pub use rate_limit::{Admission, LimitTier, RateLimit, RateLimitPolicy, RateLimitUsage, RateLimiter};
pub use retry::RetryPolicy;
