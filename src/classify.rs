use http::uri::Authority;
use http::{Method, Uri};

/// Path of the proxy auto-config script.
pub const PAC_PATH: &str = "/proxy.pac";

/// Pages the proxy serves about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalPage {
    Status,
    Pac,
    NotFound,
}

/// Where a request goes. Decided once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `CONNECT`; carries the request target as sent (`host:port`).
    Tunnel(String),
    /// Absolute-form request to relay to the origin.
    Forward,
    /// Relative-form request addressed to the proxy itself.
    Local(LocalPage),
}

pub fn classify(method: &Method, uri: &Uri) -> Route {
    if *method == Method::CONNECT {
        let target = uri
            .authority()
            .map(Authority::to_string)
            .unwrap_or_else(|| uri.to_string());
        return Route::Tunnel(target);
    }

    if uri.scheme().is_some() && uri.authority().is_some() {
        return Route::Forward;
    }

    let page = match uri.path() {
        "/" => LocalPage::Status,
        PAC_PATH => LocalPage::Pac,
        _ => LocalPage::NotFound,
    };
    Route::Local(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(method: Method, target: &str) -> Route {
        classify(&method, &target.parse().unwrap())
    }

    #[test]
    fn test_connect_goes_to_tunnel() {
        assert_eq!(
            route(Method::CONNECT, "nas.tail1234.ts.net:443"),
            Route::Tunnel("nas.tail1234.ts.net:443".to_string())
        );
        assert_eq!(route(Method::CONNECT, "100.101.102.103:22"), Route::Tunnel("100.101.102.103:22".to_string()));
    }

    #[test]
    fn test_connect_wins_over_absolute_form() {
        assert!(matches!(route(Method::CONNECT, "https://example.com:443/"), Route::Tunnel(_)));
    }

    #[test]
    fn test_absolute_form_is_forwarded() {
        assert_eq!(route(Method::GET, "http://100.64.0.7/metrics"), Route::Forward);
        assert_eq!(route(Method::POST, "https://api.ts.net/v1?x=1"), Route::Forward);
    }

    #[test]
    fn test_relative_form_is_local() {
        assert_eq!(route(Method::GET, "/"), Route::Local(LocalPage::Status));
        assert_eq!(route(Method::GET, "/proxy.pac"), Route::Local(LocalPage::Pac));
        assert_eq!(route(Method::GET, "/proxy.pac?v=2"), Route::Local(LocalPage::Pac));
        assert_eq!(route(Method::GET, "/favicon.ico"), Route::Local(LocalPage::NotFound));
        assert_eq!(route(Method::OPTIONS, "*"), Route::Local(LocalPage::NotFound));
    }
}
