//! Cache layout for downloaded models
//!
//! Hugging Face style URLs (`/<author>/<model>/resolve/<rev>/<file>`) map to
//! `<author>/<model>/<file>`; anything else lands in `external/models/<file>`.

use std::path::PathBuf;

use reqwest::Url;

/// File extensions that mark a URL as a model reference
pub const MODEL_EXTENSIONS: &[&str] = &[".gguf", ".safetensors", ".bin", ".ckpt", ".pt", ".onnx"];

/// True for `http(s)://` URLs whose path ends in a model extension
pub fn is_remote_model(value: &str) -> bool {
    let Ok(url) = Url::parse(value) else {
        return false;
    };

    if url.scheme() != "http" && url.scheme() != "https" {
        return false;
    }

    let path = url.path().to_lowercase();
    MODEL_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Path of a remote model relative to `<models>/<param_type>/`
pub fn cache_relative_path(url: &str) -> Option<PathBuf> {
    let url = Url::parse(url).ok()?;
    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();

    let filename = *segments.last()?;
    if filename == "." || filename == ".." {
        return None;
    }

    let is_hub_layout = segments.len() >= 5 && matches!(segments[2], "resolve" | "blob");
    if is_hub_layout {
        Some(PathBuf::from(segments[0]).join(segments[1]).join(filename))
    } else {
        Some(PathBuf::from("external").join("models").join(filename))
    }
}

/// Rewrite a hub `/blob/` page URL to its `/resolve/` download URL
pub fn download_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            let segments: Option<Vec<String>> = parsed
                .path_segments()
                .map(|s| s.map(str::to_string).collect());

            if let Some(mut segments) = segments {
                if segments.len() >= 5 && segments[2] == "blob" {
                    segments[2] = "resolve".to_string();
                    parsed.set_path(&format!("/{}", segments.join("/")));
                    return parsed.to_string();
                }
            }
            url.to_string()
        }
        Err(_) => url.to_string(),
    }
}
