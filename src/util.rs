use std::any::Any;
use std::sync::OnceLock;

use regex::Regex;

pub use private::Never;
mod private {
    use std::process::{ExitCode, Termination};
    /// A type that cannot be constructed. Use as a return type for functions
    /// that never return.
    pub struct Never(());
    impl Termination for Never {
        fn report(self) -> ExitCode {
            ExitCode::FAILURE
        }
    }
}

pub trait ToError<E> {
    fn to_error(self) -> E;
}

impl<E> ToError<E> for Result<Never, E> {
    fn to_error(self) -> E {
        match self {
            Ok(_) => unsafe { std::hint::unreachable_unchecked() },
            Err(e) => e,
        }
    }
}

pub fn short_name<T: ?Sized>() -> String {
    abs_to_rel_paths(std::any::type_name::<T>())
}

/// Text of a payload caught by `catch_unwind`.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Strips module paths from a type name, keeping generic structure.
pub(crate) fn abs_to_rel_paths(s: &str) -> String {
    static MODULE_PATH: OnceLock<Regex> = OnceLock::new();
    MODULE_PATH
        .get_or_init(|| Regex::new("[_a-zA-Z0-9]*::").expect("valid module path pattern"))
        .replace_all(s, "")
        .into()
}

#[test]
fn abs_to_rel_paths_works() {
    assert_eq!("String", abs_to_rel_paths("alloc::string::String"));
    assert_eq!(
        "Arc<dyn PaymentGateway>",
        abs_to_rel_paths("alloc::sync::Arc<dyn job_frame::app::services::PaymentGateway>")
    );
    assert_eq!(
        "HashMap<ServiceKey, Arc<OnceCell<Instance>>>",
        abs_to_rel_paths("std::collections::hash::map::HashMap<job_frame::container::registry::ServiceKey, alloc::sync::Arc<tokio::sync::once_cell::OnceCell<job_frame::container::registry::Instance>>>")
    );
    assert_eq!("(u32, SendEmail)", abs_to_rel_paths("(u32, job_frame::app::jobs::SendEmail)"));
    assert_eq!("SendEmailHandler", short_name::<SendEmailHandler>());
}

#[cfg(test)]
struct SendEmailHandler;
