mod model;

pub use model::{
    Account, Credential, MailAddress, MailAttachment, MailMessage, MessageFlags, StopReason,
    SyncErrorKind, SyncLimits, SyncReport, SyncTask, TaskStatus,
};
