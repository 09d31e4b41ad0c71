use super::StorageError;
use opendal::Operator;

/// 构建 S3 Operator（超时层由 [`super::OperatorStore`] 统一添加）
pub fn build_operator(
    bucket: &str,
    region: &str,
    access_key: &str,
    secret_key: &str,
    endpoint: Option<&str>,
    prefix: Option<&str>,
) -> Result<Operator, StorageError> {
    use opendal::services::S3;

    let mut builder = S3::default()
        .bucket(bucket)
        .region(region)
        .access_key_id(access_key)
        .secret_access_key(secret_key);

    if let Some(ep) = endpoint {
        builder = builder.endpoint(ep);
    }

    if let Some(p) = prefix {
        builder = builder.root(p);
    }

    Ok(Operator::new(builder)
        .map_err(|e| StorageError::Backend(format!("S3 配置无效: {}", e)))?
        .finish())
}
