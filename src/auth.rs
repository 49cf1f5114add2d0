//! Authentication and account management.

use crate::db::{Database, Role, User, UserStats, now_timestamp};
use crate::error::{AppError, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

/// Hash a password using Argon2.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))
}

/// Verify a password against a hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AppError::Internal(format!("Invalid password hash: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Signed token payload. Carries the user id only.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// Issue a signed bearer token for a user id.
pub fn issue_token(user_id: &str, secret: &str, valid_days: u32) -> Result<String> {
    let now = now_timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        iat: now,
        exp: now + i64::from(valid_days) * 24 * 60 * 60,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("Failed to sign token: {}", e)))
}

/// Verify a bearer token and return the user id it carries.
pub fn verify_token(token: &str, secret: &str) -> Result<String> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims.sub)
    .map_err(|_| AppError::Unauthenticated("Invalid or expired token".to_string()))
}

/// Authentication service.
pub struct AuthService {
    db: Database,
    jwt_secret: String,
    token_days: u32,
}

impl AuthService {
    /// Create a new auth service.
    pub fn new(db: Database, jwt_secret: String, token_days: u32) -> Self {
        Self {
            db,
            jwt_secret,
            token_days,
        }
    }

    /// Register a new reader account and return it with a fresh token.
    pub fn register(&self, username: &str, email: &str, password: &str) -> Result<(User, String)> {
        let user = self.create_user(username, email, password, Role::Reader)?;
        let token = issue_token(&user.id, &self.jwt_secret, self.token_days)?;
        Ok((user, token))
    }

    /// Create a new user with an explicit role (admin/CLI path).
    pub fn create_user(
        &self,
        username: &str,
        email: &str,
        password: &str,
        role: Role,
    ) -> Result<User> {
        let username = username.trim();
        if username.len() < 3 || username.len() > 30 {
            return Err(AppError::InvalidInput(
                "Username must be 3-30 characters".to_string(),
            ));
        }

        if !username
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            return Err(AppError::InvalidInput(
                "Username can only contain letters, numbers, _ and -".to_string(),
            ));
        }

        let email = email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(AppError::InvalidInput(
                "A valid email is required".to_string(),
            ));
        }

        if password.len() < 6 {
            return Err(AppError::InvalidInput(
                "Password must be at least 6 characters".to_string(),
            ));
        }

        let password_hash = hash_password(password)?;
        let now = now_timestamp();

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            email,
            password_hash,
            role,
            avatar: String::new(),
            bio: String::new(),
            stats: UserStats::default(),
            credits: 0,
            is_verified: false,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        self.db.create_user(&user)?;
        Ok(user)
    }

    /// Verify credentials and return the user with a fresh token.
    pub fn login(&self, email: &str, password: &str) -> Result<(User, String)> {
        let email = email.trim().to_lowercase();
        let user = self
            .db
            .get_user_by_email(&email)?
            .ok_or_else(|| AppError::Unauthenticated("Invalid email or password".to_string()))?;

        if !verify_password(password, &user.password_hash)? {
            return Err(AppError::Unauthenticated(
                "Invalid email or password".to_string(),
            ));
        }

        let token = issue_token(&user.id, &self.jwt_secret, self.token_days)?;
        Ok((user, token))
    }

    /// Resolve a bearer token to its user.
    pub fn authenticate(&self, token: &str) -> Result<User> {
        let user_id = verify_token(token, &self.jwt_secret)?;

        let user = self
            .db
            .get_user_by_id(&user_id)?
            .ok_or_else(|| AppError::Unauthenticated("User not found".to_string()))?;

        if !user.is_active {
            return Err(AppError::Forbidden("Account is disabled".to_string()));
        }

        Ok(user)
    }

    /// Change a user's password. Hashing happens only here, when the
    /// password actually changes.
    pub fn change_password(&self, username: &str, new_password: &str) -> Result<bool> {
        if new_password.len() < 6 {
            return Err(AppError::InvalidInput(
                "Password must be at least 6 characters".to_string(),
            ));
        }

        let password_hash = hash_password(new_password)?;
        self.db.update_user_password(username, &password_hash)
    }

    /// Update a user's avatar and bio, returning the fresh profile.
    pub fn update_profile(
        &self,
        user: &User,
        avatar: Option<String>,
        bio: Option<String>,
    ) -> Result<User> {
        let avatar = avatar.unwrap_or_else(|| user.avatar.clone());
        let bio = bio.unwrap_or_else(|| user.bio.clone());

        self.db.update_user_profile(&user.id, &avatar, &bio)?;

        self.db
            .get_user_by_id(&user.id)?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))
    }

    /// Delete a user and, symmetrically with book deletion, every
    /// bookmark the user owns.
    pub fn delete_user(&self, username: &str) -> Result<bool> {
        let Some(user) = self.db.get_user_by_username(username)? else {
            return Ok(false);
        };

        if let Err(e) = self.db.delete_bookmarks_for_user(&user.id) {
            tracing::warn!(error = %e, user = %user.id, "Bookmark cascade failed");
        }

        self.db.delete_user(username)
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        self.db.list_users()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_and_verify() {
        let password = "test_password_123";
        let hash = hash_password(password).unwrap();

        assert!(verify_password(password, &hash).unwrap());
        assert!(!verify_password("wrong_password", &hash).unwrap());
    }

    #[test]
    fn test_token_round_trip() {
        let token = issue_token("user-1", "secret", 7).unwrap();
        assert_eq!(verify_token(&token, "secret").unwrap(), "user-1");
    }

    #[test]
    fn test_token_wrong_secret_rejected() {
        let token = issue_token("user-1", "secret", 7).unwrap();
        assert!(verify_token(&token, "other-secret").is_err());
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(verify_token("not-a-token", "secret").is_err());
    }
}
