//! HTTP layer for the forward-auth service.
//!
//! A reverse proxy (Traefik `forwardAuth`, nginx `auth_request`, ...) sends
//! every incoming request's headers to `/validate`.  A 200 response carries
//! the resolved identity in `X-Auth-User-*` headers for the proxy to copy
//! onto the upstream request; any other status is returned to the client.

pub mod handler;
