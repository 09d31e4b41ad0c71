use super::StorageError;
use opendal::Operator;

/// 构建 WebDAV Operator
pub fn build_operator(
    endpoint: &str,
    username: &str,
    password: &str,
    root: Option<&str>,
) -> Result<Operator, StorageError> {
    use opendal::services::Webdav;

    let mut builder = Webdav::default()
        .endpoint(endpoint)
        .username(username)
        .password(password);

    if let Some(r) = root {
        builder = builder.root(r);
    }

    Ok(Operator::new(builder)
        .map_err(|e| StorageError::Backend(format!("WebDAV 配置无效: {}", e)))?
        .finish())
}
