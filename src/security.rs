//! Link security state and attribute permission checks.

use crate::att::AttErrorCode;
use crate::attribute::AccessRequirements;

/// Security level of an established link, in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityLevel {
    /// No link-layer security.
    NoSecurity,
    /// The link is encrypted.
    Encrypted,
    /// The link is encrypted with an authenticated key.
    Authenticated,
    /// The link is encrypted with an authenticated LE Secure Connections key.
    SecureConnections,
}

/// The security properties a link currently provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SecurityProperties {
    level: SecurityLevel,
    encryption_key_size: u8,
}

impl SecurityProperties {
    /// Properties of a link without any security.
    pub const INSECURE: SecurityProperties = SecurityProperties {
        level: SecurityLevel::NoSecurity,
        encryption_key_size: 0,
    };

    pub const fn new(level: SecurityLevel, encryption_key_size: u8) -> Self {
        Self {
            level,
            encryption_key_size,
        }
    }

    pub fn level(&self) -> SecurityLevel {
        self.level
    }

    pub fn encryption_key_size(&self) -> u8 {
        self.encryption_key_size
    }
}

impl Default for SecurityProperties {
    fn default() -> Self {
        Self::INSECURE
    }
}

fn check_access(
    reqs: &AccessRequirements,
    security: &SecurityProperties,
    restricted: AttErrorCode,
) -> Result<(), AttErrorCode> {
    if !reqs.allowed() {
        return Err(restricted);
    }

    if reqs.encryption_required() {
        if security.level() < SecurityLevel::Encrypted {
            return Err(AttErrorCode::InsufficientAuthentication);
        }
        if security.encryption_key_size() < reqs.min_enc_key_size() {
            return Err(AttErrorCode::InsufficientEncryption);
        }
    }

    if reqs.authentication_required() && security.level() < SecurityLevel::Authenticated {
        return Err(AttErrorCode::InsufficientAuthentication);
    }

    // Authorization is granted by the service layer, not here.
    Ok(())
}

/// Check whether a link with `security` may read an attribute guarded by
/// `reqs`.
pub fn check_read_permissions(
    reqs: &AccessRequirements,
    security: &SecurityProperties,
) -> Result<(), AttErrorCode> {
    check_access(reqs, security, AttErrorCode::ReadNotPermitted)
}

/// Check whether a link with `security` may write an attribute guarded by
/// `reqs`.
pub fn check_write_permissions(
    reqs: &AccessRequirements,
    security: &SecurityProperties,
) -> Result<(), AttErrorCode> {
    check_access(reqs, security, AttErrorCode::WriteNotPermitted)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENCRYPTED: SecurityProperties = SecurityProperties::new(SecurityLevel::Encrypted, 16);
    const AUTHENTICATED: SecurityProperties =
        SecurityProperties::new(SecurityLevel::Authenticated, 16);

    #[test]
    fn disallowed_is_never_accessible() {
        let reqs = AccessRequirements::disallowed();
        assert_eq!(
            check_read_permissions(&reqs, &AUTHENTICATED),
            Err(AttErrorCode::ReadNotPermitted)
        );
        assert_eq!(
            check_write_permissions(&reqs, &AUTHENTICATED),
            Err(AttErrorCode::WriteNotPermitted)
        );
    }

    #[test]
    fn no_security_required() {
        let reqs = AccessRequirements::allowed();
        assert_eq!(check_read_permissions(&reqs, &SecurityProperties::INSECURE), Ok(()));
    }

    #[test]
    fn encryption_required() {
        let reqs = AccessRequirements::new(true, false, false);
        assert_eq!(
            check_read_permissions(&reqs, &SecurityProperties::INSECURE),
            Err(AttErrorCode::InsufficientAuthentication)
        );
        assert_eq!(check_read_permissions(&reqs, &ENCRYPTED), Ok(()));
    }

    #[test]
    fn short_key_rejected() {
        let reqs = AccessRequirements::new(true, false, false);
        let weak = SecurityProperties::new(SecurityLevel::Encrypted, 7);
        assert_eq!(
            check_write_permissions(&reqs, &weak),
            Err(AttErrorCode::InsufficientEncryption)
        );
    }

    #[test]
    fn authentication_required() {
        let reqs = AccessRequirements::new(true, true, false);
        assert_eq!(
            check_read_permissions(&reqs, &ENCRYPTED),
            Err(AttErrorCode::InsufficientAuthentication)
        );
        assert_eq!(check_read_permissions(&reqs, &AUTHENTICATED), Ok(()));
    }

    #[test]
    fn authorization_left_to_service_layer() {
        let reqs = AccessRequirements::new(false, false, true);
        assert_eq!(check_read_permissions(&reqs, &SecurityProperties::INSECURE), Ok(()));
    }
}
