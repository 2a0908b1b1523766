use crate::entities;
use crate::errors::TrellisError;
use crate::provider::GitProvider;
use crate::settings::Database as DbCfg;
use base64ct::Encoding;
use chrono::Utc;
use rand::RngCore;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// How long an unconsumed device login request stays exchangeable.
const DEVICE_LOGIN_TTL_SECS: i64 = 1800; // 30 minutes

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub subject: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: i64,
    pub enabled: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub subject: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceLogin {
    pub device_code: String,
    pub profile_id: Option<String>, // present = approved by that user
    pub verification_code: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClusterStatus {
    Pending,
    Online,
    Offline,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Pending => "PENDING",
            ClusterStatus::Online => "ONLINE",
            ClusterStatus::Offline => "OFFLINE",
        }
    }

    fn from_db(s: &str) -> Self {
        match s {
            "ONLINE" => ClusterStatus::Online,
            "OFFLINE" => ClusterStatus::Offline,
            _ => ClusterStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub status: ClusterStatus,
    pub agent_token_hash: String,
    pub metadata: Option<Value>,
    pub last_heartbeat: Option<i64>,
    pub created_at: i64,
}

impl Cluster {
    fn from_model(model: entities::cluster::Model) -> Self {
        Cluster {
            id: model.id,
            user_id: model.user_id,
            name: model.name,
            status: ClusterStatus::from_db(&model.status),
            metadata: model
                .metadata
                .as_deref()
                .and_then(|m| serde_json::from_str(m).ok()),
            agent_token_hash: model.agent_token_hash,
            last_heartbeat: model.last_heartbeat,
            created_at: model.created_at,
        }
    }
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, TrellisError> {
    let db = Database::connect(&cfg.url).await?;
    Ok(db)
}

fn random_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

/// Generate a raw agent bearer secret: 32 bytes from the OS CSPRNG, hex
/// encoded (64 chars).
pub fn generate_agent_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// One-way hash of an agent token for at-rest storage and comparison.
pub fn hash_agent_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time comparison of a presented token's hash against the stored
/// hash.
pub fn agent_token_matches(presented: &str, stored_hash: &str) -> bool {
    let presented_hash = hash_agent_token(presented);
    presented_hash.len() == stored_hash.len()
        && bool::from(subtle::ConstantTimeEq::ct_eq(
            presented_hash.as_bytes(),
            stored_hash.as_bytes(),
        ))
}

// User management functions

pub async fn create_user(
    db: &DatabaseConnection,
    email: &str,
    password: &str,
) -> Result<User, TrellisError> {
    use argon2::password_hash::{rand_core::OsRng, SaltString};
    use argon2::{Argon2, PasswordHasher};

    let subject = random_id();
    let created_at = Utc::now().timestamp();

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| TrellisError::Other(format!("Password hashing failed: {}", e)))?
        .to_string();

    let user = entities::user::ActiveModel {
        subject: Set(subject.clone()),
        email: Set(email.to_string()),
        password_hash: Set(password_hash.clone()),
        created_at: Set(created_at),
        enabled: Set(1),
    };

    user.insert(db).await?;

    Ok(User {
        subject,
        email: email.to_string(),
        password_hash,
        created_at,
        enabled: 1,
    })
}

pub async fn get_user_by_email(
    db: &DatabaseConnection,
    email: &str,
) -> Result<Option<User>, TrellisError> {
    use entities::user::{Column, Entity};

    if let Some(model) = Entity::find().filter(Column::Email.eq(email)).one(db).await? {
        Ok(Some(User {
            subject: model.subject,
            email: model.email,
            password_hash: model.password_hash,
            created_at: model.created_at,
            enabled: model.enabled,
        }))
    } else {
        Ok(None)
    }
}

pub async fn get_user_by_subject(
    db: &DatabaseConnection,
    subject: &str,
) -> Result<Option<User>, TrellisError> {
    use entities::user::{Column, Entity};

    if let Some(model) = Entity::find()
        .filter(Column::Subject.eq(subject))
        .one(db)
        .await?
    {
        Ok(Some(User {
            subject: model.subject,
            email: model.email,
            password_hash: model.password_hash,
            created_at: model.created_at,
            enabled: model.enabled,
        }))
    } else {
        Ok(None)
    }
}

/// Returns the user's subject on success, None on unknown email, wrong
/// password, or a disabled account.
pub async fn verify_user_password(
    db: &DatabaseConnection,
    email: &str,
    password: &str,
) -> Result<Option<String>, TrellisError> {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};

    let user = match get_user_by_email(db, email).await? {
        Some(u) if u.enabled == 1 => u,
        _ => return Ok(None),
    };

    let parsed_hash = PasswordHash::new(&user.password_hash)
        .map_err(|e| TrellisError::Other(format!("Invalid password hash: {}", e)))?;

    if Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
    {
        Ok(Some(user.subject))
    } else {
        Ok(None)
    }
}

// Session management functions

pub async fn create_session(
    db: &DatabaseConnection,
    subject: &str,
    ttl_secs: i64,
    user_agent: Option<String>,
    ip_address: Option<String>,
) -> Result<Session, TrellisError> {
    let session_id = random_id();
    let now = Utc::now().timestamp();
    let expires_at = now + ttl_secs;

    let session = entities::session::ActiveModel {
        session_id: Set(session_id.clone()),
        subject: Set(subject.to_string()),
        created_at: Set(now),
        expires_at: Set(expires_at),
        user_agent: Set(user_agent.clone()),
        ip_address: Set(ip_address.clone()),
    };

    session.insert(db).await?;

    Ok(Session {
        session_id,
        subject: subject.to_string(),
        created_at: now,
        expires_at,
        user_agent,
        ip_address,
    })
}

pub async fn get_session(
    db: &DatabaseConnection,
    session_id: &str,
) -> Result<Option<Session>, TrellisError> {
    use entities::session::{Column, Entity};

    if let Some(model) = Entity::find()
        .filter(Column::SessionId.eq(session_id))
        .one(db)
        .await?
    {
        // Check if session is expired
        let now = Utc::now().timestamp();
        if now > model.expires_at {
            return Ok(None);
        }

        Ok(Some(Session {
            session_id: model.session_id,
            subject: model.subject,
            created_at: model.created_at,
            expires_at: model.expires_at,
            user_agent: model.user_agent,
            ip_address: model.ip_address,
        }))
    } else {
        Ok(None)
    }
}

pub async fn delete_session(db: &DatabaseConnection, session_id: &str) -> Result<(), TrellisError> {
    use entities::session::{Column, Entity};

    Entity::delete_many()
        .filter(Column::SessionId.eq(session_id))
        .exec(db)
        .await?;

    Ok(())
}

pub async fn cleanup_expired_sessions(db: &DatabaseConnection) -> Result<u64, TrellisError> {
    use entities::session::{Column, Entity};

    let now = Utc::now().timestamp();
    let result = Entity::delete_many()
        .filter(Column::ExpiresAt.lt(now))
        .exec(db)
        .await?;

    Ok(result.rows_affected)
}

// Provider token functions

pub async fn upsert_provider_token(
    db: &DatabaseConnection,
    user_id: &str,
    provider: GitProvider,
    access_token: &str,
) -> Result<(), TrellisError> {
    use entities::provider_token::{ActiveModel, Column, Entity};

    let now = Utc::now().timestamp();

    let model = ActiveModel {
        user_id: Set(user_id.to_string()),
        provider: Set(provider.as_str().to_string()),
        access_token: Set(access_token.to_string()),
        updated_at: Set(now),
    };

    Entity::insert(model)
        .on_conflict(
            OnConflict::columns([Column::UserId, Column::Provider])
                .update_columns([Column::AccessToken, Column::UpdatedAt])
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    Ok(())
}

pub async fn get_provider_token(
    db: &DatabaseConnection,
    user_id: &str,
    provider: GitProvider,
) -> Result<Option<String>, TrellisError> {
    use entities::provider_token::{Column, Entity};

    let model = Entity::find()
        .filter(Column::UserId.eq(user_id))
        .filter(Column::Provider.eq(provider.as_str()))
        .one(db)
        .await?;

    Ok(model.map(|m| m.access_token))
}

// Device login functions

/// Upsert a device login request keyed by the CLI-generated device code.
/// Re-approval with the same code overwrites the owner; the original
/// created_at/expires_at survive so re-approval never extends the window.
pub async fn upsert_device_login(
    db: &DatabaseConnection,
    device_code: &str,
    profile_id: Option<String>,
    verification_code: Option<String>,
) -> Result<(), TrellisError> {
    use entities::device_login::{ActiveModel, Column, Entity};

    let now = Utc::now().timestamp();

    let model = ActiveModel {
        device_code: Set(device_code.to_string()),
        profile_id: Set(profile_id),
        verification_code: Set(verification_code),
        created_at: Set(now),
        expires_at: Set(now + DEVICE_LOGIN_TTL_SECS),
    };

    Entity::insert(model)
        .on_conflict(
            OnConflict::column(Column::DeviceCode)
                .update_columns([Column::ProfileId, Column::VerificationCode])
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    Ok(())
}

pub async fn get_device_login(
    db: &DatabaseConnection,
    device_code: &str,
) -> Result<Option<DeviceLogin>, TrellisError> {
    use entities::device_login::{Column, Entity};

    let now = Utc::now().timestamp();

    let result = Entity::find()
        .filter(Column::DeviceCode.eq(device_code))
        .one(db)
        .await?;

    match result {
        Some(dl) if dl.expires_at >= now => Ok(Some(DeviceLogin {
            device_code: dl.device_code,
            profile_id: dl.profile_id,
            verification_code: dl.verification_code,
            created_at: dl.created_at,
            expires_at: dl.expires_at,
        })),
        _ => Ok(None),
    }
}

/// Consume an approved device login: delete the row and return its data.
/// Returns None when the code is unknown, expired, not yet approved, or was
/// already consumed by a concurrent exchange. The delete-by-key is the
/// at-most-once guard: of two racing exchanges, only one observes
/// rows_affected == 1.
pub async fn consume_device_login(
    db: &DatabaseConnection,
    device_code: &str,
) -> Result<Option<DeviceLogin>, TrellisError> {
    use entities::device_login::{Column, Entity};

    let now = Utc::now().timestamp();

    let dl = match Entity::find()
        .filter(Column::DeviceCode.eq(device_code))
        .one(db)
        .await?
    {
        Some(dl) => dl,
        None => return Ok(None),
    };

    if dl.expires_at < now || dl.profile_id.is_none() {
        return Ok(None);
    }

    let result = Entity::delete_many()
        .filter(Column::DeviceCode.eq(device_code))
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        // Lost the race to a concurrent exchange
        return Ok(None);
    }

    Ok(Some(DeviceLogin {
        device_code: dl.device_code,
        profile_id: dl.profile_id,
        verification_code: dl.verification_code,
        created_at: dl.created_at,
        expires_at: dl.expires_at,
    }))
}

/// Cleanup expired device login requests
pub async fn cleanup_expired_device_logins(db: &DatabaseConnection) -> Result<u64, TrellisError> {
    use entities::device_login::{Column, Entity};

    let now = Utc::now().timestamp();

    let result = Entity::delete_many()
        .filter(Column::ExpiresAt.lt(now))
        .exec(db)
        .await?;

    Ok(result.rows_affected)
}

// Cluster functions

/// Register a cluster: generates the agent bearer secret, stores only its
/// hash, and creates the row as PENDING. Returns the cluster and the raw
/// secret; this is the only place the plaintext ever exists server-side.
pub async fn create_cluster(
    db: &DatabaseConnection,
    user_id: &str,
    name: &str,
    metadata: Value,
) -> Result<(Cluster, String), TrellisError> {
    let id = uuid::Uuid::new_v4().to_string();
    let raw_token = generate_agent_token();
    let token_hash = hash_agent_token(&raw_token);
    let now = Utc::now().timestamp();

    let model = entities::cluster::ActiveModel {
        id: Set(id.clone()),
        user_id: Set(user_id.to_string()),
        name: Set(name.to_string()),
        status: Set(ClusterStatus::Pending.as_str().to_string()),
        agent_token_hash: Set(token_hash.clone()),
        metadata: Set(Some(serde_json::to_string(&metadata)?)),
        last_heartbeat: Set(None),
        created_at: Set(now),
    };

    model.insert(db).await?;

    Ok((
        Cluster {
            id,
            user_id: user_id.to_string(),
            name: name.to_string(),
            status: ClusterStatus::Pending,
            agent_token_hash: token_hash,
            metadata: Some(metadata),
            last_heartbeat: None,
            created_at: now,
        },
        raw_token,
    ))
}

pub async fn get_cluster(
    db: &DatabaseConnection,
    cluster_id: &str,
) -> Result<Option<Cluster>, TrellisError> {
    use entities::cluster::{Column, Entity};

    let model = Entity::find()
        .filter(Column::Id.eq(cluster_id))
        .one(db)
        .await?;

    Ok(model.map(Cluster::from_model))
}

/// Accepted heartbeat: stamp last_heartbeat and move the cluster ONLINE.
/// Concurrent heartbeats race harmlessly; last write wins.
pub async fn record_heartbeat(
    db: &DatabaseConnection,
    cluster_id: &str,
) -> Result<(), TrellisError> {
    use entities::cluster::{Column, Entity};

    let now = Utc::now().timestamp();

    if let Some(cluster) = Entity::find()
        .filter(Column::Id.eq(cluster_id))
        .one(db)
        .await?
    {
        let mut active: entities::cluster::ActiveModel = cluster.into();
        active.last_heartbeat = Set(Some(now));
        active.status = Set(ClusterStatus::Online.as_str().to_string());
        active.update(db).await?;
    }

    Ok(())
}

/// All clusters owned by a user, newest first. Owner scoping is mandatory;
/// the connection may carry elevated credentials.
pub async fn list_clusters(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<Vec<Cluster>, TrellisError> {
    use entities::cluster::{Column, Entity};

    let models = Entity::find()
        .filter(Column::UserId.eq(user_id))
        .order_by_desc(Column::CreatedAt)
        .all(db)
        .await?;

    Ok(models.into_iter().map(Cluster::from_model).collect())
}
