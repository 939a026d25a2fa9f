/*
 * Responsibility
 * - Router 全体に掛ける横断的 middleware (request id / trace / timeout / body limit)
 * - GET レスポンスの cache middleware
 */
pub mod http;
pub mod http_cache;
