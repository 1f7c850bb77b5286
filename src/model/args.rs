//! Rewrite model-bearing launch flags to local cache paths

use tokio_util::sync::CancellationToken;

use super::resolver::ModelResolver;
use crate::error::Result;

/// Launch flags whose value may be a remote model URL
pub const MODEL_FLAGS: &[&str] = &[
    "--model",
    "--sdmodel",
    "--sdt5xxl",
    "--sdclipl",
    "--sdclipg",
    "--sdphotomaker",
    "--sdvae",
    "--sdlora",
    "--mmproj",
    "--whispermodel",
    "--draftmodel",
    "--ttsmodel",
    "--ttswavtokenizer",
    "--embeddingsmodel",
];

fn is_model_flag(arg: &str) -> bool {
    MODEL_FLAGS.contains(&arg)
}

/// Resolve every `(flag, value)` pair for the model-bearing flags.
///
/// Order and pairing are preserved; `--flag=value` is kept in that form.
/// A failed download falls back to the original value, but an abort
/// stops the walk and is returned as is.
pub async fn resolve_launch_args(
    resolver: &ModelResolver,
    args: &[String],
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let mut resolved = Vec::with_capacity(args.len());
    let mut iter = args.iter().peekable();

    while let Some(arg) = iter.next() {
        if let Some((flag, value)) = arg.split_once('=') {
            if is_model_flag(flag) {
                let local = resolve_value(resolver, flag, value, cancel).await?;
                resolved.push(format!("{}={}", flag, local));
                continue;
            }
        }

        resolved.push(arg.clone());

        if is_model_flag(arg) {
            if let Some(value) = iter.next_if(|next| !next.starts_with("--")) {
                resolved.push(resolve_value(resolver, arg, value, cancel).await?);
            }
        }
    }

    Ok(resolved)
}

async fn resolve_value(
    resolver: &ModelResolver,
    flag: &str,
    value: &str,
    cancel: &CancellationToken,
) -> Result<String> {
    let param_type = flag.trim_start_matches('-');

    match resolver.resolve(value, param_type, cancel).await {
        Ok(local) => Ok(local),
        Err(e) if e.is_aborted() => Err(e),
        Err(e) => {
            log::warn!("Could not resolve {} {}: {}. Passing it through unchanged", flag, value, e);
            Ok(value.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::test_support::TestServer;
    use hyper::{Body, Response, StatusCode};
    use tempfile::tempdir;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_rewrites_only_model_flags() {
        let server = TestServer::start(|req| {
            if req.uri().path().ends_with("missing.gguf") {
                let mut resp = Response::new(Body::empty());
                *resp.status_mut() = StatusCode::NOT_FOUND;
                resp
            } else {
                Response::new(Body::from("weights"))
            }
        })
        .await;

        let dir = tempdir().unwrap();
        let resolver = ModelResolver::new(dir.path().to_path_buf(), EventBus::new()).unwrap();

        let model_url = server.url("/a/b/resolve/main/m.gguf");
        let mmproj_url = server.url("/x/proj.gguf");
        let missing_url = server.url("/x/missing.gguf");
        let args = vec![
            "--port".to_string(),
            "5001".to_string(),
            "--model".to_string(),
            model_url,
            format!("--mmproj={}", mmproj_url),
            "--draftmodel".to_string(),
            missing_url.clone(),
            "--contextsize".to_string(),
            "4096".to_string(),
        ];

        let out = resolve_launch_args(&resolver, &args, &CancellationToken::new())
            .await
            .unwrap();

        let model_path = dir.path().join("model/a/b/m.gguf");
        let mmproj_path = dir.path().join("mmproj/external/models/proj.gguf");
        assert_eq!(
            out,
            vec![
                "--port".to_string(),
                "5001".to_string(),
                "--model".to_string(),
                model_path.to_string_lossy().to_string(),
                format!("--mmproj={}", mmproj_path.display()),
                "--draftmodel".to_string(),
                missing_url,
                "--contextsize".to_string(),
                "4096".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_flag_without_value_is_kept() {
        let dir = tempdir().unwrap();
        let resolver = ModelResolver::new(dir.path().to_path_buf(), EventBus::new()).unwrap();

        let args = strings(&["--model", "--usecublas"]);
        let out = resolve_launch_args(&resolver, &args, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, args);
    }

    #[tokio::test]
    async fn test_cancelled_scope_aborts() {
        let server = TestServer::start(|_| Response::new(Body::from("weights"))).await;
        let dir = tempdir().unwrap();
        let resolver = ModelResolver::new(dir.path().to_path_buf(), EventBus::new()).unwrap();

        let scope = CancellationToken::new();
        scope.cancel();

        let args = strings(&["--model", &server.url("/m.gguf")]);
        let err = resolve_launch_args(&resolver, &args, &scope).await.unwrap_err();
        assert!(err.is_aborted());
    }
}
