use bcrypt::{hash, verify, DEFAULT_COST};
use lms_core::PasswordHash;
use lms_error::{LmsError, Result};
use rand::{distributions::Alphanumeric, Rng};

const MIN_LENGTH: usize = 8;
const MAX_LENGTH: usize = 128;
const SPECIAL_CHARS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";

/// 密码服务 - 处理密码哈希、验证和生成
pub struct PasswordService;

impl PasswordService {
    /// 校验强度后生成 bcrypt 哈希
    pub fn hash_password(password: &str) -> Result<PasswordHash> {
        Self::validate_password_strength(password)?;
        Self::hash_unchecked(password)
    }

    /// 不做强度校验，供引导管理员等受信任路径使用
    pub fn hash_unchecked(password: &str) -> Result<PasswordHash> {
        hash(password, DEFAULT_COST)
            .map(PasswordHash::from_hash)
            .map_err(|e| LmsError::Internal {
                message: format!("Failed to hash password: {}", e),
                details: None,
            })
    }

    /// 验证密码
    pub fn verify_password(password: &str, hash: &PasswordHash) -> Result<bool> {
        verify(password, hash.as_str()).map_err(|e| LmsError::Internal {
            message: format!("Failed to verify password: {}", e),
            details: None,
        })
    }

    /// 生成满足强度要求的临时密码
    pub fn generate_password(length: usize) -> String {
        let length = length.clamp(MIN_LENGTH, MAX_LENGTH);
        let mut rng = rand::thread_rng();
        loop {
            let mut candidate: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(length - 1)
                .map(char::from)
                .collect();
            let special = SPECIAL_CHARS.as_bytes()[rng.gen_range(0..SPECIAL_CHARS.len())];
            candidate.insert(rng.gen_range(0..length), char::from(special));
            if Self::validate_password_strength(&candidate).is_ok() {
                return candidate;
            }
        }
    }

    /// 验证密码强度
    pub fn validate_password_strength(password: &str) -> Result<()> {
        let length = password.chars().count();
        if length < MIN_LENGTH {
            return Err(LmsError::validation("password", "密码长度至少8位"));
        }

        if length > MAX_LENGTH {
            return Err(LmsError::validation("password", "密码长度不能超过128位"));
        }

        let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
        let has_digit = password.chars().any(|c| c.is_ascii_digit());
        let has_special = password.chars().any(|c| SPECIAL_CHARS.contains(c));

        let complexity_score = [has_lower, has_upper, has_digit, has_special]
            .iter()
            .filter(|&&b| b)
            .count();

        if complexity_score < 3 {
            return Err(LmsError::validation(
                "password",
                "密码必须包含大写字母、小写字母、数字和特殊字符中的至少3种",
            ));
        }

        // 检查常见弱密码
        let weak_patterns = ["password", "123456", "qwerty", "abc123", "letmein", "admin"];
        let lowered = password.to_lowercase();
        if weak_patterns.iter().any(|weak| lowered.contains(weak)) {
            return Err(LmsError::validation("password", "密码不能包含常见的弱密码模式"));
        }

        Ok(())
    }
}
