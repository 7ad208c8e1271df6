//! Maps URL construction and artifact key derivation.
//!
//! Key derivation must be bit-exact: the storage path doubles as the natural
//! key for idempotent metadata inserts, so the same target and job must
//! always produce the same path.

use url::form_urlencoded;

use crate::TargetLocation;

/// Build the maps URL for one target.
///
/// Shape: `{base}/maps/@{lat},{lon},{zoom}z?zoom={zoom}&data=!5m1!1e1&entry=ttu`
/// merged with `gmaps_extra_params`. An extra entry whose key matches a fixed
/// parameter replaces it in place; each key appears in the query once.
pub fn map_url(base_url: &str, target: &TargetLocation) -> String {
    let mut params: Vec<(String, String)> = vec![
        ("zoom".to_string(), target.gmaps_zoom.to_string()),
        ("data".to_string(), "!5m1!1e1".to_string()),
        ("entry".to_string(), "ttu".to_string()),
    ];

    if let Some(serde_json::Value::Object(extra)) = &target.gmaps_extra_params {
        for (key, value) in extra {
            let value = scalar_to_string(value);
            match params.iter_mut().find(|(k, _)| k == key) {
                Some(pair) => pair.1 = value,
                None => params.push((key.clone(), value)),
            }
        }
    }

    let mut query = form_urlencoded::Serializer::new(String::new());
    for (key, value) in &params {
        query.append_pair(key, value);
    }

    format!(
        "{}/maps/@{},{},{}z?{}",
        base_url.trim_end_matches('/'),
        target.latitude,
        target.longitude,
        target.gmaps_zoom,
        query.finish()
    )
}

/// Derive the storage key for one target within one job:
/// `{folder}/{job_id}/{id}__{slug}__{lat}_{lon}__{zoom}z.jpg`.
pub fn artifact_key(target: &TargetLocation, job_id: &str) -> String {
    format!(
        "{}/{}/{}__{}__{}_{}__{}z.jpg",
        target.folder,
        job_id,
        target.id,
        slug(&target.name),
        target.latitude,
        target.longitude,
        target.gmaps_zoom
    )
}

/// Lowercased name with spaces replaced by hyphens.
fn slug(name: &str) -> String {
    name.to_lowercase().replace(' ', "-")
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
