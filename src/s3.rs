use std::sync::Arc;

use anyhow::Result;
use aws_config::meta::region::RegionProviderChain;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    Client as S3Client,
};

use crate::config::AppConfig;
use crate::storage::{ObjectStorage, S3Storage};

pub async fn build_client(config: &AppConfig) -> Result<S3Client> {
    let region_provider =
        RegionProviderChain::first_try(Some(Region::new(config.aws_region.clone())))
            .or_default_provider()
            .or_else("us-east-1");

    #[allow(deprecated)]
    let mut loader = aws_config::from_env().region(region_provider);

    if let Some(endpoint) = &config.aws_endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }

    match (&config.aws_access_key_id, &config.aws_secret_access_key) {
        (Some(access_key), Some(secret_key)) => {
            let credentials = Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "orphanage-static",
            );
            loader = loader.credentials_provider(credentials);
        }
        (Some(_), None) | (None, Some(_)) => {
            tracing::warn!("only one of AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY is set; using the default credential chain");
        }
        (None, None) => {}
    }

    let base_config = loader.load().await;
    let s3_config = S3ConfigBuilder::from(&base_config)
        .force_path_style(config.aws_endpoint_url.is_some())
        .build();

    Ok(S3Client::from_conf(s3_config))
}

/// Storage backend for child photos and documents.
pub async fn build_storage(config: &AppConfig) -> Result<Arc<dyn ObjectStorage>> {
    let client = build_client(config).await?;
    tracing::info!(
        bucket = %config.s3_bucket,
        custom_endpoint = config.aws_endpoint_url.is_some(),
        "object storage ready"
    );
    Ok(Arc::new(S3Storage::new(client, config.s3_bucket.clone())))
}
