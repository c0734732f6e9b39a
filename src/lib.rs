#[macro_use]
extern crate error_chain;

pub mod apply;
pub mod config;
pub mod credentials;
pub mod crd;
pub mod engine;
pub mod manager;
pub mod rollout;
pub mod scrape;
pub mod selector;
pub mod store;
pub mod synth;

pub mod errors {
    // Create the Error, ErrorKind, ResultExt, and Result types
    error_chain! {
        foreign_links {
            Io(std::io::Error);
            Json(serde_json::Error);
            Yaml(serde_yaml::Error);
            Kube(kube::Error);
        }

        errors {
            Selection(kind: String, namespace: String) {
                description("selector evaluation failed")
                display("cannot list {} in namespace {:?}", kind, namespace)
            }
            MissingObject(kind: String, namespace: String, name: String) {
                description("referenced object does not exist")
                display("{} {}/{} not found", kind, namespace, name)
            }
            MissingKey(kind: String, namespace: String, name: String, key: String) {
                description("referenced key does not exist")
                display("{} {}/{} has no key {:?}", kind, namespace, name, key)
            }
            Apply(kind: String, key: String) {
                description("cannot apply child object")
                display("cannot apply {} {}", kind, key)
            }
            ReadinessTimeout(component: String, waited_secs: i64) {
                description("component did not become ready in time")
                display("{} not ready after {}s", component, waited_secs)
            }
            DeadlineExceeded {
                description("reconcile deadline exceeded")
                display("reconcile deadline exceeded")
            }
            InvalidConfig(field: String, value: String) {
                description("invalid configuration value")
                display("invalid value {:?} for {}", value, field)
            }
            MissingCrd(name: String) {
                description("custom resource definition is not installed")
                display("crd {} is not installed", name)
            }
        }
    }

    impl Error {
        /// Transient failures are retried on the next pass instead of failing
        /// the component.
        pub fn is_retryable(&self) -> bool {
            match self.kind() {
                ErrorKind::DeadlineExceeded => return true,
                ErrorKind::Kube(e) => return transient(e),
                _ => {}
            }
            match self.1.next_error.as_ref() {
                Some(cause) => {
                    if let Some(e) = cause.downcast_ref::<Error>() {
                        e.is_retryable()
                    } else if let Some(e) = cause.downcast_ref::<kube::Error>() {
                        transient(e)
                    } else {
                        false
                    }
                }
                None => false,
            }
        }

        /// HTTP status of the underlying api server response, if any.
        pub fn api_code(&self) -> Option<u16> {
            if let ErrorKind::Kube(kube::Error::Api(resp)) = self.kind() {
                return Some(resp.code);
            }
            let cause = self.1.next_error.as_ref()?;
            if let Some(e) = cause.downcast_ref::<Error>() {
                return e.api_code();
            }
            match cause.downcast_ref::<kube::Error>() {
                Some(kube::Error::Api(resp)) => Some(resp.code),
                _ => None,
            }
        }
    }

    fn transient(e: &kube::Error) -> bool {
        match e {
            kube::Error::Api(resp) => resp.code == 409 || resp.code == 429 || resp.code >= 500,
            kube::Error::HyperError(_) | kube::Error::Service(_) => true,
            _ => false,
        }
    }
}
