//! Company onboarding, invitations, allowed domains and uploaded data files.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sea_orm::DatabaseConnection;
use serde_json::json;
use uuid::Uuid;

use super::chunking::parse_csv;
use crate::auth::CurrentUser;
use crate::clients::BlobStore;
use crate::db::{TenantConnector, is_valid_server_name};
use crate::error::{ApiError, ErrorCode, forbidden, invalid_request, is_unique_violation, not_found};
use crate::models::master::tenant;
use crate::models::tenant::{company_user, csv_file};
use crate::repositories::{
    CompanyRepository, CompanyUserRepository, CsvFileRepository, InvitationTokenRepository,
    NewCompanyUser, TenantRepository,
};

pub const INVITE_CODE_LENGTH: usize = 12;
pub const DEFAULT_INVITE_DAYS: i64 = 30;
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

const INVITE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Roles allowed to manage invitations and domains.
pub const ADMIN_ROLES: [&str; 2] = ["admin", "company_admin"];

/// Outcome of [`create_company`].
#[derive(Debug, Clone)]
pub struct CreatedCompany {
    pub company_id: Uuid,
    pub invite_code: String,
}

/// Random `[A-Z0-9]{12}` code from the thread-local CSPRNG.
pub fn generate_invite_code() -> String {
    let mut rng = rand::thread_rng();
    (0..INVITE_CODE_LENGTH)
        .map(|_| INVITE_ALPHABET[rng.gen_range(0..INVITE_ALPHABET.len())] as char)
        .collect()
}

/// Creates the tenant schema and company row, then registers it in master.
///
/// If the master registration fails the tenant company row is deleted again.
pub async fn create_company(
    master: &DatabaseConnection,
    tenants: &TenantConnector,
    company_name: &str,
    server_name: &str,
) -> Result<CreatedCompany, ApiError> {
    if !is_valid_server_name(server_name) {
        return Err(invalid_request("Invalid company server name")
            .with_details(json!({ "company_server_name": server_name })));
    }
    let registry = TenantRepository::new(master);
    if registry.find_by_company_name(company_name).await?.is_some() {
        return Err(ApiError::new(ErrorCode::DuplicateEntry, "Company already exists")
            .with_details(json!({ "company_name": company_name })));
    }

    let tenant_db = tenants.initialize(server_name).await?;
    let companies = CompanyRepository::new(&tenant_db);
    let company = companies.create(company_name, server_name).await?;

    if let Err(error) = registry.create(company_name, company.id, server_name).await {
        tracing::error!(company_id = %company.id, %error, "Master registration failed; rolling back tenant company");
        if let Err(rollback) = companies.delete(company.id).await {
            tracing::error!(company_id = %company.id, error = %rollback, "Rollback of tenant company failed");
        }
        if is_unique_violation(&error) {
            return Err(ApiError::new(
                ErrorCode::DuplicateEntry,
                "Company server name already exists",
            ));
        }
        return Err(ApiError::new(
            ErrorCode::DatabaseError,
            "Failed to register company in master database; rollback attempted",
        )
        .with_details(json!({ "original_error": error.to_string() })));
    }

    let invite_code = generate_invite_code();
    InvitationTokenRepository::new(master)
        .create(
            company.id,
            &invite_code,
            Utc::now() + Duration::days(DEFAULT_INVITE_DAYS),
        )
        .await?;

    tracing::info!(company_id = %company.id, server = server_name, "Company created");
    Ok(CreatedCompany {
        company_id: company.id,
        invite_code,
    })
}

async fn registered_tenant(
    master: &DatabaseConnection,
    company_id: Uuid,
) -> Result<tenant::Model, ApiError> {
    TenantRepository::new(master)
        .find_by_company_id(company_id)
        .await?
        .ok_or_else(|| not_found(format!("Company not found: {}", company_id)))
}

fn require_admin(user: &CurrentUser) -> Result<(), ApiError> {
    if ADMIN_ROLES.contains(&user.role.as_str()) {
        return Ok(());
    }
    Err(forbidden(Some(&format!(
        "Role '{}' is not allowed. Allowed roles: {}",
        user.role,
        ADMIN_ROLES.join(", ")
    ))))
}

/// Appends a fresh invite code for the caller's own company.
pub async fn create_invite_code(
    master: &DatabaseConnection,
    user: &CurrentUser,
    company_id: Uuid,
    expires_in_days: i64,
) -> Result<(String, DateTime<Utc>), ApiError> {
    if user.company_id != company_id {
        return Err(forbidden(Some(
            "You can only create invite codes for your own company",
        )));
    }
    require_admin(user)?;
    if expires_in_days <= 0 {
        return Err(invalid_request("expires_in_days must be positive"));
    }
    registered_tenant(master, company_id).await?;

    let code = generate_invite_code();
    let row = InvitationTokenRepository::new(master)
        .add_token(company_id, &code, Utc::now() + Duration::days(expires_in_days))
        .await?;
    tracing::info!(%company_id, "Invite code generated");
    Ok((code, row.expires_at))
}

fn bare_domain(domain: &str) -> String {
    domain.trim_start_matches('@').to_lowercase()
}

/// True when the domain after the last `@` of `email` is listed.
///
/// Listed domains match with or without their leading `@`.
pub fn is_allowed_domain(email: &str, allowed: &[String]) -> bool {
    let Some((_, domain)) = email.rsplit_once('@') else {
        return false;
    };
    let domain = domain.to_lowercase();
    allowed.iter().any(|d| bare_domain(d) == domain)
}

/// Replaces the company's allowed domains. Each must start with `@`.
pub async fn update_allowed_domains(
    master: &DatabaseConnection,
    user: &CurrentUser,
    company_id: Uuid,
    domains: Vec<String>,
) -> Result<Vec<String>, ApiError> {
    require_admin(user)?;
    let tenant = registered_tenant(master, company_id).await?;
    if user.role == "company_admin" && user.company_id != company_id {
        return Err(forbidden(Some("他の会社のドメインは更新できません")));
    }
    if let Some(bad) = domains.iter().find(|d| !d.starts_with('@')) {
        return Err(ApiError::new(
            ErrorCode::InvalidDomainFormat,
            format!("ドメインは'@'で始まる必要があります: {}", bad),
        ));
    }

    let updated = TenantRepository::new(master)
        .set_allowed_domains(&tenant, domains)
        .await?;
    Ok(updated.allowed_domains.into())
}

pub async fn allowed_domains(
    master: &DatabaseConnection,
    user: &CurrentUser,
    company_id: Uuid,
) -> Result<Vec<String>, ApiError> {
    require_admin(user)?;
    if user.role == "company_admin" && user.company_id != company_id {
        return Err(forbidden(Some("他の会社のドメインは取得できません")));
    }
    Ok(registered_tenant(master, company_id)
        .await?
        .allowed_domains
        .into())
}

/// Admits a sign-up by allowed domain or by consuming a live invite code.
///
/// Errors carry the message shown to the user by the identity provider.
pub async fn verify_invite(
    master: &DatabaseConnection,
    company_id: Uuid,
    email: &str,
    invite_code: Option<&str>,
) -> Result<(), ApiError> {
    let tenant = registered_tenant(master, company_id).await?;
    if is_allowed_domain(email, &tenant.allowed_domains.0) {
        tracing::info!(%company_id, "Sign-up admitted by allowed domain");
        return Ok(());
    }

    let Some(code) = invite_code.filter(|c| !c.is_empty()) else {
        return Err(ApiError::new(ErrorCode::InvalidInviteCode, "招待コードが必要です"));
    };
    if !InvitationTokenRepository::new(master)
        .consume(company_id, code, Utc::now())
        .await?
    {
        return Err(ApiError::new(ErrorCode::InvalidInviteCode, "無効な招待コードです"));
    }
    tracing::info!(%company_id, "Sign-up admitted by invite code");
    Ok(())
}

/// Creates the `company_users` row for a freshly registered identity.
pub async fn provision_user(
    master: &DatabaseConnection,
    tenants: &TenantConnector,
    user: NewCompanyUser,
) -> Result<company_user::Model, ApiError> {
    let (_, tenant_db) = tenants.for_company(master, user.company_id).await?;
    let users = CompanyUserRepository::new(&tenant_db);
    if users.find_by_azure_id(&user.azure_user_id).await?.is_some() {
        return Err(ApiError::new(ErrorCode::DuplicateEntry, "User already exists"));
    }
    Ok(users.create(user).await?)
}

/// Stores an uploaded CSV under `{company_id}/{timestamp}_{file_name}`.
pub async fn upload_csv(
    blob: &dyn BlobStore,
    tenant_db: &DatabaseConnection,
    company_id: Uuid,
    file_name: &str,
    content_type: Option<&str>,
    data: Vec<u8>,
) -> Result<csv_file::Model, ApiError> {
    if content_type != Some("text/csv") {
        return Err(invalid_request(
            "アップロードされたファイルはCSV形式ではありません。",
        ));
    }
    if data.len() > MAX_UPLOAD_BYTES {
        return Err(ApiError::new(
            ErrorCode::PayloadTooLarge,
            "ファイルサイズが制限を超えています（10MBまで）",
        ));
    }

    let now = Utc::now();
    let blob_name = format!("{}/{}_{}", company_id, now.format("%Y%m%d%H%M%S"), file_name);
    let size = data.len() as i64;
    let blob_url = blob.upload(&blob_name, data, "text/csv").await?;
    let file = CsvFileRepository::new(tenant_db)
        .create(company_id, file_name, size, &blob_url, now)
        .await?;
    tracing::info!(%company_id, file_id = %file.id, size, "CSV uploaded");
    Ok(file)
}

/// Recreates `csv_files` rows for blobs under the company prefix.
///
/// Blobs whose URL is already recorded are skipped.
pub async fn restore_csv_metadata(
    blob: &dyn BlobStore,
    tenant_db: &DatabaseConnection,
    company_id: Uuid,
) -> Result<Vec<csv_file::Model>, ApiError> {
    let files = CsvFileRepository::new(tenant_db);
    let mut restored = Vec::new();
    for item in blob.list(&format!("{}/", company_id)).await? {
        let url = blob.url_for(&item.name);
        if files.exists_with_url(&url).await? {
            continue;
        }
        let uploaded_at = item.created_at.unwrap_or_else(Utc::now);
        let file = files
            .create(company_id, item.file_name(), item.size, &url, uploaded_at)
            .await?;
        restored.push(file);
    }
    tracing::info!(%company_id, restored = restored.len(), "Restored CSV metadata");
    Ok(restored)
}

async fn company_file(
    tenant_db: &DatabaseConnection,
    company_id: Uuid,
    file_id: Uuid,
) -> Result<csv_file::Model, ApiError> {
    CsvFileRepository::new(tenant_db)
        .find(file_id)
        .await?
        .filter(|f| f.company_id == company_id)
        .ok_or_else(|| {
            not_found("CSVファイルが見つかりません").with_details(json!({ "file_id": file_id }))
        })
}

/// The file row together with the number of CSV records in its blob.
pub async fn file_status(
    blob: &dyn BlobStore,
    tenant_db: &DatabaseConnection,
    company_id: Uuid,
    file_id: Uuid,
) -> Result<(csv_file::Model, usize), ApiError> {
    let file = company_file(tenant_db, company_id, file_id).await?;
    let data = blob.download(&file.blob_url).await?;
    let records = parse_csv(&data)
        .map_err(|e| {
            ApiError::new(
                ErrorCode::InternalServerError,
                "CSVファイルの読み込み中にエラーが発生しました",
            )
            .with_details(json!({ "error": e.to_string() }))
        })?
        .len();
    Ok((file, records))
}

/// Deletes the blob, then the row.
pub async fn delete_csv(
    blob: &dyn BlobStore,
    tenant_db: &DatabaseConnection,
    company_id: Uuid,
    file_id: Uuid,
) -> Result<(), ApiError> {
    let file = company_file(tenant_db, company_id, file_id).await?;
    blob.delete(&file.blob_url).await?;
    CsvFileRepository::new(tenant_db).delete(file.id).await?;
    tracing::info!(%company_id, %file_id, "CSV deleted");
    Ok(())
}

/// Current prompt template, NOT_FOUND when the tenant has no company row.
pub async fn prompt_template(
    tenant_db: &DatabaseConnection,
    company_id: Uuid,
) -> Result<String, ApiError> {
    CompanyRepository::new(tenant_db)
        .find(company_id)
        .await?
        .map(|c| c.prompt_template)
        .ok_or_else(|| not_found(format!("Company {} not found", company_id)))
}

pub async fn set_prompt_template(
    tenant_db: &DatabaseConnection,
    company_id: Uuid,
    template: &str,
) -> Result<(), ApiError> {
    prompt_template(tenant_db, company_id).await?;
    CompanyRepository::new(tenant_db)
        .set_prompt_template(company_id, template)
        .await?;
    tracing::info!(%company_id, "Prompt template updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{master_db, tenant_db};

    fn user(company_id: Uuid, role: &str) -> CurrentUser {
        CurrentUser {
            user_id: Uuid::new_v4(),
            name: "Aoi".to_string(),
            company_id,
            role: role.to_string(),
        }
    }

    async fn registered(master: &DatabaseConnection) -> Uuid {
        let company_id = Uuid::new_v4();
        TenantRepository::new(master)
            .create("Acme", company_id, "acme-db")
            .await
            .unwrap();
        company_id
    }

    #[test]
    fn invite_codes_are_twelve_uppercase_alphanumerics() {
        let code = generate_invite_code();
        assert_eq!(code.len(), INVITE_CODE_LENGTH);
        assert!(code.bytes().all(|b| INVITE_ALPHABET.contains(&b)));
        assert_ne!(code, generate_invite_code());
    }

    #[test]
    fn allowed_domain_ignores_case_and_at_prefix() {
        let allowed = vec!["@Example.com".to_string(), "corp.jp".to_string()];
        assert!(is_allowed_domain("a@example.COM", &allowed));
        assert!(is_allowed_domain("b@corp.jp", &allowed));
        assert!(!is_allowed_domain("c@other.com", &allowed));
        assert!(!is_allowed_domain("no-at-sign", &allowed));
        assert!(!is_allowed_domain("d@example.com", &[]));
    }

    #[tokio::test]
    async fn create_company_registers_tenant_and_default_code() {
        let master = master_db().await;
        let tenants = TenantConnector::from_config(&crate::config::AppConfig::default());
        tenants.register("acme-db", tenant_db().await).await;

        let created = create_company(&master, &tenants, "Acme", "acme-db")
            .await
            .unwrap();
        assert_eq!(created.invite_code.len(), INVITE_CODE_LENGTH);

        let tenant = TenantRepository::new(&master)
            .find_by_company_id(created.company_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tenant.company_server_name, "acme-db");

        let tokens = InvitationTokenRepository::new(&master)
            .find_by_company(created.company_id)
            .await
            .unwrap()
            .unwrap();
        assert!(tokens.tokens.contains(&created.invite_code));
        assert!(tokens.expires_at > Utc::now() + Duration::days(29));

        let err = create_company(&master, &tenants, "Acme", "acme-db")
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::DuplicateEntry));
    }

    #[tokio::test]
    async fn server_clash_rolls_back_tenant_company() {
        let master = master_db().await;
        let tenants = TenantConnector::from_config(&crate::config::AppConfig::default());
        let shared = tenant_db().await;
        tenants.register("shared-db", shared.clone()).await;

        create_company(&master, &tenants, "First", "shared-db")
            .await
            .unwrap();
        let err = create_company(&master, &tenants, "Second", "shared-db")
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::DuplicateEntry));
        assert!(
            CompanyRepository::new(&shared)
                .find_by_name("Second")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn malformed_server_name_is_rejected_before_any_write() {
        let master = master_db().await;
        let tenants = TenantConnector::from_config(&crate::config::AppConfig::default());

        let err = create_company(&master, &tenants, "Acme", "attacker.example:5432/x?")
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::InvalidRequest));
        assert!(
            TenantRepository::new(&master)
                .find_by_company_name("Acme")
                .await
                .unwrap()
                .is_none()
        );
        assert!(tenants.cached_servers().await.is_empty());
    }

    #[tokio::test]
    async fn invite_codes_require_admin_of_same_company() {
        let master = master_db().await;
        let company_id = registered(&master).await;

        let err = create_invite_code(&master, &user(company_id, "user"), company_id, 7)
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::AuthorizationError));

        let err = create_invite_code(&master, &user(Uuid::new_v4(), "admin"), company_id, 7)
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::AuthorizationError));

        let (code, expires_at) =
            create_invite_code(&master, &user(company_id, "company_admin"), company_id, 7)
                .await
                .unwrap();
        assert!(expires_at > Utc::now() + Duration::days(6));

        verify_invite(&master, company_id, "new@elsewhere.com", Some(&code))
            .await
            .unwrap();
        let err = verify_invite(&master, company_id, "again@elsewhere.com", Some(&code))
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::InvalidInviteCode));
        assert_eq!(&*err.message, "無効な招待コードです");
    }

    #[tokio::test]
    async fn verify_invite_accepts_allowed_domain_without_code() {
        let master = master_db().await;
        let company_id = registered(&master).await;
        let admin = user(company_id, "admin");

        let err = verify_invite(&master, company_id, "x@acme.co.jp", None)
            .await
            .unwrap_err();
        assert_eq!(&*err.message, "招待コードが必要です");

        update_allowed_domains(&master, &admin, company_id, vec!["@acme.co.jp".into()])
            .await
            .unwrap();
        verify_invite(&master, company_id, "x@ACME.co.jp", None)
            .await
            .unwrap();

        let err = verify_invite(&master, Uuid::new_v4(), "x@acme.co.jp", None)
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn allowed_domains_validate_format_and_scope() {
        let master = master_db().await;
        let company_id = registered(&master).await;

        let err = update_allowed_domains(
            &master,
            &user(company_id, "admin"),
            company_id,
            vec!["acme.co.jp".into()],
        )
        .await
        .unwrap_err();
        assert!(err.is(ErrorCode::InvalidDomainFormat));

        let err = allowed_domains(&master, &user(Uuid::new_v4(), "company_admin"), company_id)
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::AuthorizationError));

        let domains = allowed_domains(&master, &user(Uuid::new_v4(), "admin"), company_id)
            .await
            .unwrap();
        assert!(domains.is_empty());
    }

    #[tokio::test]
    async fn prompt_template_round_trip() {
        let db = tenant_db().await;
        let company = CompanyRepository::new(&db)
            .create("Acme", "acme-db")
            .await
            .unwrap();

        assert_eq!(prompt_template(&db, company.id).await.unwrap(), "");
        set_prompt_template(&db, company.id, "敬語で回答してください")
            .await
            .unwrap();
        assert_eq!(
            prompt_template(&db, company.id).await.unwrap(),
            "敬語で回答してください"
        );
        assert!(
            set_prompt_template(&db, Uuid::new_v4(), "x")
                .await
                .unwrap_err()
                .is(ErrorCode::NotFound)
        );
    }
}
