use jsonwebtoken::{DecodingKey, Validation, decode};
use uuid::Uuid;

use huddle_types::api::Claims;

/// Verify an HS256 bearer token issued by the auth service.
pub fn verify_token(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
}

/// Convenience for callers that only need the subject.
pub fn user_id_from_token(token: &str, secret: &str) -> Option<Uuid> {
    verify_token(token, secret).ok().map(|claims| claims.sub)
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{EncodingKey, Header, encode};

    use super::*;

    fn token(secret: &str, sub: Uuid, exp: i64) -> String {
        let claims = Claims { sub, exp: exp as usize };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn accepts_valid_and_rejects_foreign_or_expired_tokens() {
        let user = Uuid::new_v4();
        let exp = (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp();

        assert_eq!(user_id_from_token(&token("s3cret", user, exp), "s3cret"), Some(user));
        assert_eq!(user_id_from_token(&token("other", user, exp), "s3cret"), None);

        let expired = (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp();
        assert_eq!(user_id_from_token(&token("s3cret", user, expired), "s3cret"), None);
        assert_eq!(user_id_from_token("garbage", "s3cret"), None);
    }
}
