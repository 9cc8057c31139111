//! Route path composition.
//!
//! Every composition point (global prefix + controller prefix, base path +
//! method path) goes through [`join`], so prefix-less controllers, prefix-less
//! methods and doubly-slashed inputs all converge on one canonical path.

/// Normalizes a path segment to a single leading slash and no trailing slash.
///
/// The root path `"/"` is kept as is, and an empty input becomes `"/"`.
pub fn normalize(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    format!("/{}", trimmed)
}

/// Joins two path segments after normalizing both.
pub fn join(base: &str, path: &str) -> String {
    let base = normalize(base);
    let path = normalize(path);
    if base == "/" {
        return path;
    }
    if path == "/" {
        return base;
    }
    format!("{}{}", base, path)
}

/// Converts `:name` and `*name` segments to axum's `{name}` / `{*name}` syntax.
///
/// Segments already written in braces pass through unchanged.
pub fn to_axum_path(path: &str) -> String {
    let segments: Vec<String> = path
        .split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{}}}", name)
            } else if let Some(name) = segment.strip_prefix('*') {
                let name = if name.is_empty() { "wildcard" } else { name };
                format!("{{*{}}}", name)
            } else {
                segment.to_string()
            }
        })
        .collect();
    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_handles_edge_inputs() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("//"), "/");
        assert_eq!(normalize("/a/"), "/a");
        assert_eq!(normalize("/a//"), "/a");
        assert_eq!(normalize("users"), "/users");
        assert_eq!(normalize("//users/:id/"), "/users/:id");
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in ["", "/", "a", "/a/", "a/b/", "//x//y//", " /padded/ ", "/:id"] {
            let once = normalize(input);
            assert_eq!(normalize(&once), once, "input {:?}", input);
        }
    }

    #[test]
    fn join_treats_root_as_identity() {
        for p in ["/", "/users", "/users/:id", "/a/b/c"] {
            assert_eq!(join("/", p), p);
            assert_eq!(join(p, "/"), p);
        }
        assert_eq!(join("", ""), "/");
    }

    #[test]
    fn join_composes_prefixes() {
        assert_eq!(join("/api", "/users"), "/api/users");
        assert_eq!(join("api/", "users/"), "/api/users");
        assert_eq!(join(&join("/api", "users"), "/:id"), "/api/users/:id");
        assert_eq!(join("/users", ""), "/users");
    }

    #[test]
    fn axum_path_conversion() {
        assert_eq!(to_axum_path("/users/:id"), "/users/{id}");
        assert_eq!(to_axum_path("/files/*rest"), "/files/{*rest}");
        assert_eq!(to_axum_path("/files/*"), "/files/{*wildcard}");
        assert_eq!(to_axum_path("/users/{id}"), "/users/{id}");
        assert_eq!(to_axum_path("/"), "/");
    }
}
