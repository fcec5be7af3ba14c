mod client;
mod credentials;
mod error;
mod sessions;
mod throttle;
mod types;

pub use client::{MailProvider, RestMailProvider};
pub use credentials::{CredentialProvider, OAuthCredentialProvider};
pub use error::ProviderError;
pub use sessions::{AuthSessions, PendingAuthSession};
pub use throttle::Throttle;
pub use types::{decode_base64url, MessagePage, RawAttachment, RawBody, RawHeader, RawMessage, RawPart};
