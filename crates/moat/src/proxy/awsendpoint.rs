//! AWS credentials endpoint, `GET /_aws/credentials`.

use http::StatusCode;
use tracing::error;

use crate::aws::{AwsCredentialProvider, EcsCredentialResponse};
use crate::client::{full_body, Response};

pub async fn handle_aws_credentials(provider: &AwsCredentialProvider) -> Response {
	match provider.credentials().await {
		Ok(creds) => {
			let body = EcsCredentialResponse::from(&creds);
			let json = serde_json::to_vec(&body).expect("ecs credential response always serializes");
			let mut response = http::Response::new(full_body(bytes::Bytes::from(json)));
			response.headers_mut().insert(http::header::CONTENT_TYPE, "application/json".parse().unwrap());
			response
		}
		Err(e) => {
			error!(error = %e, "sts assume-role failed");
			let mut response = http::Response::new(full_body(bytes::Bytes::from_static(b"failed to obtain aws credentials")));
			*response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
			response
		}
	}
}

pub fn unauthorized_response() -> Response {
	let mut response = http::Response::new(full_body(bytes::Bytes::from_static(b"Unauthorized")));
	*response.status_mut() = StatusCode::UNAUTHORIZED;
	response
}
