use crate::api::error::AppError;
use crate::catalog;
use crate::entities::datasets;
use chrono::{Datelike, Utc};
use sea_orm::DatabaseConnection;

/// Lowest numeric id handed out by the minting counter.
const NUMERIC_ID_FLOOR: i32 = 10_000;
const NUMERIC_ID_CEIL: i32 = 99_999;

/// Canonical 8-4-4-4-12 hex UUID form.
pub fn looks_like_uuid(s: &str) -> bool {
    let segments: Vec<&str> = s.split('-').collect();
    segments.len() == 5
        && [8, 4, 4, 4, 12]
            .iter()
            .zip(&segments)
            .all(|(len, seg)| seg.len() == *len && seg.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Map any of the four identifier forms to the canonical record.
///
/// Heuristic, first hit wins: UUID form, then all-digits (numeric id), then
/// slug, then name. Name lookups are scoped to `owner_hint` when one is
/// known; a global name matching more than one dataset is refused.
pub async fn resolve(
    db: &DatabaseConnection,
    identifier: &str,
    owner_hint: Option<&str>,
) -> Result<datasets::Model, AppError> {
    let identifier = identifier.trim();
    if identifier.is_empty() {
        return Err(AppError::Validation("empty dataset identifier".into()));
    }

    if looks_like_uuid(identifier) {
        return catalog::datasets::get_by_uuid(db, identifier)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("dataset not found: {identifier}")));
    }

    if !identifier.is_empty() && identifier.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(numeric_id) = identifier.parse::<i32>() {
            return catalog::datasets::get_by_numeric_id(db, numeric_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("dataset not found: {identifier}")));
        }
    }

    if let Some(dataset) = catalog::datasets::get_by_slug(db, identifier).await? {
        return Ok(dataset);
    }

    if let Some(owner) = owner_hint {
        if let Some(dataset) = catalog::datasets::get_by_owner_and_name(db, owner, identifier).await? {
            return Ok(dataset);
        }
    }

    let matches = catalog::datasets::find_by_name_global(db, identifier).await?;
    match matches.len() {
        0 => Err(AppError::NotFound(format!("dataset not found: {identifier}"))),
        1 => Ok(matches.into_iter().next().unwrap()),
        _ => Err(AppError::AmbiguousIdentifier(format!(
            "name '{identifier}' matches several datasets; use the uuid"
        ))),
    }
}

/// Kebab-case the human name: lower-case, collapse non-alphanumeric runs to
/// single hyphens, trim.
pub fn slugify_name(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    slug
}

fn owner_prefix(owner_email: &str) -> String {
    let local = owner_email.split('@').next().unwrap_or(owner_email);
    slugify_name(local)
}

/// `{owner-prefix}-{kebab-name}-{year}`, with `-2`, `-3`… until unique.
pub async fn mint_slug(
    db: &DatabaseConnection,
    name: &str,
    owner_email: &str,
) -> Result<String, AppError> {
    let base = format!(
        "{}-{}-{}",
        owner_prefix(owner_email),
        slugify_name(name),
        Utc::now().year()
    );

    if !catalog::datasets::slug_exists(db, &base).await? {
        return Ok(base);
    }

    for n in 2.. {
        let candidate = format!("{base}-{n}");
        if !catalog::datasets::slug_exists(db, &candidate).await? {
            return Ok(candidate);
        }
    }
    unreachable!()
}

/// Next candidate from the monotonic counter. The caller inserts with it and
/// retries with the successor on a uniqueness collision.
pub async fn next_numeric_id(db: &DatabaseConnection) -> Result<i32, AppError> {
    let max = catalog::datasets::max_numeric_id(db).await?;
    Ok(successor_numeric_id(max))
}

pub fn successor_numeric_id(current_max: Option<i32>) -> i32 {
    match current_max {
        Some(id) if id >= NUMERIC_ID_CEIL => NUMERIC_ID_FLOOR,
        Some(id) if id >= NUMERIC_ID_FLOOR => id + 1,
        _ => NUMERIC_ID_FLOOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_form_detection() {
        assert!(looks_like_uuid("550e8400-e29b-41d4-a716-446655440000"));
        assert!(!looks_like_uuid("550e8400-e29b-41d4-a716"));
        assert!(!looks_like_uuid("my-data-2024"));
        assert!(!looks_like_uuid("zzze8400-e29b-41d4-a716-446655440000"));
    }

    #[test]
    fn slugify_collapses_runs() {
        assert_eq!(slugify_name("My Data"), "my-data");
        assert_eq!(slugify_name("  CT -- Scan #42  "), "ct-scan-42");
        assert_eq!(slugify_name("4D_Nexus/run"), "4d-nexus-run");
    }

    #[test]
    fn owner_prefix_is_local_part() {
        assert_eq!(owner_prefix("a.b@example.com"), "a-b");
        assert_eq!(owner_prefix("amy@lab.edu"), "amy");
    }

    #[test]
    fn numeric_counter_is_monotonic_and_wraps() {
        assert_eq!(successor_numeric_id(None), 10_000);
        assert_eq!(successor_numeric_id(Some(12_344)), 12_345);
        assert_eq!(successor_numeric_id(Some(99_999)), 10_000);
        // ids below the floor (never minted by us) restart the counter
        assert_eq!(successor_numeric_id(Some(7)), 10_000);
    }
}
