use crate::{
    error::AppError,
    models::{ResolvedRunContext, RunPayload, SessionContext},
    runs::{get_repository_binding, get_run},
    state::AppState,
};

const DEFAULT_SERVICES_YAML_PATH: &str = "services.yaml";

/// Loads the run, its payload and repository binding for one call. Never cached.
pub async fn resolve_run_context(
    state: &AppState,
    session: &SessionContext,
    require_credential: bool,
) -> Result<ResolvedRunContext, AppError> {
    let run_id = session.run_id.trim();
    if run_id.is_empty() {
        return Err(AppError::BadRequest("run_id is required".to_string()));
    }

    let run = get_run(&state.db, run_id)
        .await?
        .ok_or_else(|| AppError::NotFound("run not found".to_string()))?;
    if !run.is_active() {
        return Err(AppError::Forbidden(format!(
            "run status {:?} is not active",
            run.status
        )));
    }

    let payload = parse_run_payload(&run.run_payload)?;

    let repository_id = payload.project.repository_id.trim();
    if repository_id.is_empty() {
        return Err(AppError::Conflict(
            "run payload missing repository_id".to_string(),
        ));
    }

    let mut repository = get_repository_binding(&state.db, repository_id)
        .await?
        .ok_or_else(|| AppError::NotFound("repository binding not found".to_string()))?;

    let mut owner = repository.owner.trim().to_string();
    let mut name = repository.name.trim().to_string();
    if owner.is_empty() || name.is_empty() {
        if let Some((fallback_owner, fallback_name)) =
            split_repo_full_name(&payload.repository.full_name)
        {
            if owner.is_empty() {
                owner = fallback_owner.to_string();
            }
            if name.is_empty() {
                name = fallback_name.to_string();
            }
        }
    }
    if owner.is_empty() || name.is_empty() {
        return Err(AppError::Conflict(
            "repository owner/name are required".to_string(),
        ));
    }
    repository.owner = owner;
    repository.name = name;
    if repository.services_yaml_path.trim().is_empty() {
        repository.services_yaml_path = DEFAULT_SERVICES_YAML_PATH.to_string();
    }

    let mut session = session.clone();
    if session.correlation_id.trim().is_empty() {
        session.correlation_id = run.correlation_id.trim().to_string();
    }
    if session.project_id.trim().is_empty() {
        session.project_id = [
            run.project_id.trim(),
            repository.project_id.trim(),
            payload.project.id.trim(),
        ]
        .into_iter()
        .find(|v| !v.is_empty())
        .unwrap_or_default()
        .to_string();
    }

    let mut run_ctx = ResolvedRunContext {
        session,
        run,
        repository,
        payload,
        credential: None,
    };
    if require_credential {
        attach_credential(state, &mut run_ctx)?;
    }
    Ok(run_ctx)
}

/// Decrypts the repository credential into an already resolved context.
pub fn attach_credential(
    state: &AppState,
    run_ctx: &mut ResolvedRunContext,
) -> Result<(), AppError> {
    if run_ctx.credential.is_some() {
        return Ok(());
    }
    let encrypted = run_ctx
        .repository
        .token_encrypted
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Conflict("repository credential is not configured".to_string()))?;
    run_ctx.credential = Some(state.crypt.decrypt_string(encrypted)?);
    Ok(())
}

/// Decodes the opaque run payload; empty or malformed payloads fail closed.
pub fn parse_run_payload(raw: &str) -> Result<RunPayload, AppError> {
    if raw.trim().is_empty() {
        return Err(AppError::corrupt("run payload", "payload is empty"));
    }
    serde_json::from_str(raw).map_err(|e| AppError::corrupt("run payload", e))
}

pub fn split_repo_full_name(full_name: &str) -> Option<(&str, &str)> {
    let mut parts = full_name.trim().split('/');
    let owner = parts.next()?.trim();
    let name = parts.next()?.trim();
    if parts.next().is_some() || owner.is_empty() || name.is_empty() {
        return None;
    }
    Some((owner, name))
}

#[cfg(test)]
mod tests {
    use super::{parse_run_payload, split_repo_full_name};

    #[test]
    fn payload_parse_fails_closed() {
        assert!(parse_run_payload("").is_err());
        assert!(parse_run_payload("{not json").is_err());

        let payload = parse_run_payload(
            r#"{"project":{"id":"p1","repository_id":"r1"},"trigger":{"kind":"ops","label":"run:ops"},"agent":{"key":"sre"}}"#,
        )
        .expect("payload should parse");
        assert_eq!(payload.project.repository_id, "r1");
        assert_eq!(payload.trigger_kind(), "ops");
        assert_eq!(payload.agent_key(), "sre");
        assert!(payload.issue.is_none());
    }

    #[test]
    fn repo_full_name_needs_exactly_two_parts() {
        assert_eq!(split_repo_full_name("acme/api"), Some(("acme", "api")));
        assert_eq!(split_repo_full_name(" acme / api "), Some(("acme", "api")));
        assert_eq!(split_repo_full_name("acme"), None);
        assert_eq!(split_repo_full_name("acme/api/extra"), None);
        assert_eq!(split_repo_full_name("/api"), None);
    }
}
