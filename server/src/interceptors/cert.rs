use joblib::types::Identity;
use tonic::{Request, Status};
use tracing::debug;
use x509_parser::{certificate::X509Certificate, traits::FromDer};

/// The caller's identity, as stored in request extensions by `extract_subject_cn`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserExtension {
    pub identity: Identity,
}

/// A tonic interceptor service function.
///
/// Extracts the subject common name from the verified client certificate and adds it to the request extensions.
pub fn extract_subject_cn(mut req: Request<()>) -> Result<Request<()>, Status> {
    let client_certs = req
        .peer_certs()
        .ok_or_else(|| Status::unauthenticated("Request missing client cert"))?;
    // the leaf certificate comes first
    let der = client_certs
        .first()
        .ok_or_else(|| Status::unauthenticated("Request missing client cert"))?
        .get_ref();

    let identity = identity_from_der(der)?;
    debug!(identity = %identity, "authenticated client");
    req.extensions_mut().insert(UserExtension { identity });
    Ok(req)
}

fn identity_from_der(der: &[u8]) -> Result<Identity, Status> {
    let (rem, cert) =
        X509Certificate::from_der(der).map_err(|_| Status::unauthenticated("Bad client cert"))?;
    if !rem.is_empty() {
        return Err(Status::unauthenticated("Bad client cert"));
    }

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .ok_or_else(|| Status::unauthenticated("Client cert missing subject common name"))?;
    let common_name = common_name
        .as_str()
        .map_err(|_| Status::unauthenticated("Client cert common name must be a string"))?;
    if common_name.is_empty() {
        return Err(Status::unauthenticated("Client cert common name is empty"));
    }
    Ok(common_name.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn request_without_client_cert_is_rejected() {
        let err = extract_subject_cn(Request::new(())).unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
    }

    #[test]
    fn garbage_cert_is_rejected() {
        let err = identity_from_der(b"not a certificate").unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
    }
}
