//! Periodic feed aggregation.
//!
//! Every tick claims the least recently fetched feed(s), fetches them and
//! stores their items as posts. The claim stamps `last_fetched_at` before any
//! network I/O, so a slow or hanging fetch is never picked up twice.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::db::{Database, Feed, NewPost};
use crate::error::{Error, Result};
use crate::fetcher::Fetcher;

/// Outcome of processing one claimed feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapeReport {
    pub feed_id: i64,
    pub feed_name: String,
    pub new_posts: usize,
    /// Items whose url was already stored
    pub duplicates: usize,
    /// Items that failed to insert for any other reason
    pub failed: usize,
    pub fetch_error: Option<String>,
}

#[derive(Clone)]
pub struct Aggregator {
    db: Arc<Database>,
    fetcher: Arc<Fetcher>,
    interval: Duration,
    workers: usize,
}

impl Aggregator {
    pub fn new(db: Arc<Database>, fetcher: Arc<Fetcher>, interval: Duration) -> Self {
        Self {
            db,
            fetcher,
            interval,
            workers: 1,
        }
    }

    /// Number of feeds processed concurrently per tick.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Run until the process is terminated.
    pub async fn run(&self) {
        self.run_until(std::future::pending()).await
    }

    /// Run ticks until `shutdown` resolves. A tick in progress is finished first.
    pub async fn run_until<F: Future<Output = ()>>(&self, shutdown: F) {
        info!(
            "Aggregator started (interval: {:?}, workers: {})",
            self.interval, self.workers
        );

        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Aggregator stopping");
                    break;
                }
                _ = timer.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One aggregation cycle. Feeds claimed during this tick are not eligible
    /// again until the next one.
    pub async fn tick(&self) -> Vec<ScrapeReport> {
        let tick_started = Utc::now();

        if self.workers == 1 {
            return self.scrape_next_feed(tick_started).await.into_iter().collect();
        }

        let mut set = JoinSet::new();
        for _ in 0..self.workers {
            let this = self.clone();
            set.spawn(async move { this.scrape_next_feed(tick_started).await });
        }

        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => error!("Aggregation worker panicked: {}", e),
            }
        }
        reports
    }

    /// Claim the least recently fetched feed and process it. Returns `None`
    /// when no feed is eligible.
    pub async fn scrape_next_feed(&self, stale_before: DateTime<Utc>) -> Option<ScrapeReport> {
        let feed = match self.db.claim_next_feed(stale_before).await {
            Ok(Some(feed)) => feed,
            Ok(None) => {
                debug!("No feeds due for fetching");
                return None;
            }
            Err(e) => {
                error!("Failed to claim next feed: {}", e);
                return None;
            }
        };

        Some(self.scrape_feed(&feed).await)
    }

    /// Fetch an already claimed feed and store its items.
    pub async fn scrape_feed(&self, feed: &Feed) -> ScrapeReport {
        let mut report = ScrapeReport {
            feed_id: feed.id,
            feed_name: feed.name.clone(),
            ..Default::default()
        };

        info!("Fetching feed: {} ({})", feed.name, feed.url);

        let parsed = match self.fetcher.fetch(&feed.url).await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Failed to fetch feed '{}': {}", feed.name, e);
                let message = e.to_string();
                if let Err(err) = self.db.record_fetch_result(feed.id, Some(&message)).await {
                    error!("Failed to record error for feed '{}': {}", feed.name, err);
                }
                report.fetch_error = Some(message);
                return report;
            }
        };

        for item in parsed.items {
            let post = NewPost {
                feed_id: feed.id,
                title: item.title,
                url: item.link,
                description: item.description,
                published_at: item.published_at,
            };

            match self.db.create_post(&post).await {
                Ok(_) => report.new_posts += 1,
                Err(e) if e.is_conflict() => {
                    debug!("Post already stored: {}", post.url);
                    report.duplicates += 1;
                }
                Err(e) => {
                    error!("Failed to store post {} for feed '{}': {}", post.url, feed.name, e);
                    report.failed += 1;
                }
            }
        }

        if let Err(e) = self.db.record_fetch_result(feed.id, None).await {
            error!("Failed to clear error for feed '{}': {}", feed.name, e);
        }

        info!(
            "Feed '{}': {} new post(s), {} already known",
            feed.name, report.new_posts, report.duplicates
        );
        report
    }
}

/// Longest accepted aggregation interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(30 * 24 * 3600);

/// Parse an interval such as `30s`, `1m`, `1h30m` or `500ms`.
pub fn parse_interval(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::Argument("interval must not be empty".to_string()));
    }

    let invalid = || {
        Error::Argument(format!(
            "invalid interval '{}' (expected e.g. 30s, 1m, 1h30m)",
            input
        ))
    };
    let is_number = |c: char| c.is_ascii_digit() || c == '.';

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let number_end = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        if number_end == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_end].parse().map_err(|_| invalid())?;
        rest = &rest[number_end..];

        let unit_end = rest.find(is_number).unwrap_or(rest.len());
        let secs = match &rest[..unit_end] {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_end..];

        let part = Duration::try_from_secs_f64(secs).map_err(|_| invalid())?;
        total = total.checked_add(part).ok_or_else(invalid)?;
    }

    if total.is_zero() {
        return Err(Error::Argument(format!("interval must be positive: '{}'", input)));
    }
    if total > MAX_INTERVAL {
        return Err(Error::Argument(format!(
            "interval '{}' exceeds the maximum of {}h",
            input,
            MAX_INTERVAL.as_secs() / 3600
        )));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use chrono::Duration as ChronoDuration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rss_with_items(links: &[&str]) -> String {
        let items: String = links
            .iter()
            .enumerate()
            .map(|(i, link)| {
                format!(
                    "<item><title>Post {} &amp;amp; more</title><link>{}</link>\
                     <pubDate>Mon, 09 Dec 2024 1{}:00:00 GMT</pubDate></item>",
                    i, link, i
                )
            })
            .collect();
        format!(
            r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Test</title>{}</channel></rss>"#,
            items
        )
    }

    async fn mount_feed(server: &MockServer, route: &str, body: String) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    async fn setup() -> (Arc<Database>, Aggregator) {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        db.create_user("owner").await.unwrap();
        let db = Arc::new(db);

        let fetcher = Fetcher::new(&FetchConfig {
            timeout_secs: 2,
            user_agent: "gator-test".to_string(),
        })
        .unwrap();
        let aggregator = Aggregator::new(db.clone(), Arc::new(fetcher), Duration::from_secs(60));
        (db, aggregator)
    }

    async fn add_feed(db: &Database, name: &str, url: &str) -> Feed {
        let owner = db.get_user_by_name("owner").await.unwrap().unwrap();
        db.create_feed(name, url, owner.id).await.unwrap()
    }

    mod parse_interval_tests {
        use super::*;

        #[test]
        fn test_single_units() {
            assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
            assert_eq!(parse_interval("1m").unwrap(), Duration::from_secs(60));
            assert_eq!(parse_interval("2h").unwrap(), Duration::from_secs(7200));
            assert_eq!(parse_interval("500ms").unwrap(), Duration::from_millis(500));
        }

        #[test]
        fn test_compound() {
            assert_eq!(parse_interval("1h30m").unwrap(), Duration::from_secs(5400));
            assert_eq!(parse_interval("1m30s").unwrap(), Duration::from_secs(90));
        }

        #[test]
        fn test_fractional() {
            assert_eq!(parse_interval("1.5m").unwrap(), Duration::from_secs(90));
        }

        #[test]
        fn test_rejects_missing_unit() {
            assert!(matches!(parse_interval("10"), Err(Error::Argument(_))));
        }

        #[test]
        fn test_rejects_unknown_unit() {
            assert!(matches!(parse_interval("10d"), Err(Error::Argument(_))));
        }

        #[test]
        fn test_rejects_garbage() {
            assert!(parse_interval("").is_err());
            assert!(parse_interval("s").is_err());
            assert!(parse_interval("fast").is_err());
        }

        #[test]
        fn test_rejects_overflow() {
            assert!(matches!(
                parse_interval("99999999999999999999h"),
                Err(Error::Argument(_))
            ));
            assert!(matches!(
                parse_interval("18446744073709551615s1s"),
                Err(Error::Argument(_))
            ));
        }

        #[test]
        fn test_rejects_above_maximum() {
            assert!(matches!(parse_interval("721h"), Err(Error::Argument(_))));
            assert_eq!(parse_interval("720h").unwrap(), MAX_INTERVAL);
        }

        #[test]
        fn test_rejects_zero() {
            assert!(matches!(parse_interval("0s"), Err(Error::Argument(_))));
        }
    }

    mod scrape_tests {
        use super::*;

        #[tokio::test]
        async fn test_scrape_inserts_all_items() {
            let server = MockServer::start().await;
            mount_feed(
                &server,
                "/feed.xml",
                rss_with_items(&["https://a.com/1", "https://a.com/2", "https://a.com/3"]),
            )
            .await;

            let (db, aggregator) = setup().await;
            let feed = add_feed(&db, "Blog", &format!("{}/feed.xml", server.uri())).await;

            let report = aggregator.scrape_next_feed(Utc::now()).await.unwrap();

            assert_eq!(report.feed_id, feed.id);
            assert_eq!(report.new_posts, 3);
            assert_eq!(report.duplicates, 0);
            assert!(report.fetch_error.is_none());
            assert_eq!(db.count_posts_for_feed(feed.id).await.unwrap(), 3);
        }

        #[tokio::test]
        async fn test_refetch_unchanged_feed_adds_nothing() {
            let server = MockServer::start().await;
            mount_feed(
                &server,
                "/feed.xml",
                rss_with_items(&["https://a.com/1", "https://a.com/2"]),
            )
            .await;

            let (db, aggregator) = setup().await;
            let feed = add_feed(&db, "Blog", &format!("{}/feed.xml", server.uri())).await;

            let first = aggregator.scrape_feed(&feed).await;
            let second = aggregator.scrape_feed(&feed).await;

            assert_eq!(first.new_posts, 2);
            assert_eq!(second.new_posts, 0);
            assert_eq!(second.duplicates, 2);
            assert_eq!(second.failed, 0);
            assert_eq!(db.count_posts_for_feed(feed.id).await.unwrap(), 2);
        }

        #[tokio::test]
        async fn test_preexisting_urls_are_skipped() {
            let server = MockServer::start().await;
            mount_feed(
                &server,
                "/feed.xml",
                rss_with_items(&["https://a.com/1", "https://a.com/2", "https://a.com/3"]),
            )
            .await;

            let (db, aggregator) = setup().await;
            let feed = add_feed(&db, "Blog", &format!("{}/feed.xml", server.uri())).await;
            db.create_post(&NewPost {
                feed_id: feed.id,
                title: "Seen".to_string(),
                url: "https://a.com/2".to_string(),
                description: None,
                published_at: None,
            })
            .await
            .unwrap();

            let report = aggregator.scrape_feed(&feed).await;

            assert_eq!(report.new_posts, 2);
            assert_eq!(report.duplicates, 1);
            assert_eq!(db.count_posts_for_feed(feed.id).await.unwrap(), 3);
        }

        #[tokio::test]
        async fn test_titles_stored_decoded() {
            let server = MockServer::start().await;
            mount_feed(&server, "/feed.xml", rss_with_items(&["https://a.com/1"])).await;

            let (db, aggregator) = setup().await;
            let feed = add_feed(&db, "Blog", &format!("{}/feed.xml", server.uri())).await;
            let user = db.get_user_by_name("owner").await.unwrap().unwrap();
            db.create_feed_follow(user.id, feed.id).await.unwrap();

            aggregator.scrape_feed(&feed).await;

            let posts = db.list_posts_for_user(user.id, 10).await.unwrap();
            assert_eq!(posts.len(), 1);
            assert_eq!(posts[0].title, "Post 0 & more");
            assert!(posts[0].published_at.is_some());
        }

        #[tokio::test]
        async fn test_fetch_error_is_recorded_and_not_fatal() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/broken.xml"))
                .respond_with(ResponseTemplate::new(500))
                .mount(&server)
                .await;
            mount_feed(&server, "/ok.xml", rss_with_items(&["https://ok.com/1"])).await;

            let (db, aggregator) = setup().await;
            let broken = add_feed(&db, "Broken", &format!("{}/broken.xml", server.uri())).await;
            let ok = add_feed(&db, "Ok", &format!("{}/ok.xml", server.uri())).await;

            let first = aggregator.scrape_next_feed(Utc::now()).await.unwrap();
            assert_eq!(first.feed_id, broken.id);
            assert!(first.fetch_error.is_some());

            let stored = db.get_feed(broken.id).await.unwrap().unwrap();
            assert!(stored.last_fetched_at.is_some());
            assert!(stored.last_error.unwrap().contains("500"));

            // The failing feed went to the back of the queue
            let second = aggregator.scrape_next_feed(Utc::now()).await.unwrap();
            assert_eq!(second.feed_id, ok.id);
            assert_eq!(second.new_posts, 1);
        }

        #[tokio::test]
        async fn test_success_clears_previous_error() {
            let server = MockServer::start().await;
            mount_feed(&server, "/feed.xml", rss_with_items(&["https://a.com/1"])).await;

            let (db, aggregator) = setup().await;
            let feed = add_feed(&db, "Blog", &format!("{}/feed.xml", server.uri())).await;
            db.record_fetch_result(feed.id, Some("earlier failure"))
                .await
                .unwrap();

            aggregator.scrape_feed(&feed).await;

            let stored = db.get_feed(feed.id).await.unwrap().unwrap();
            assert!(stored.last_error.is_none());
        }

        #[tokio::test]
        async fn test_no_feeds_yields_none() {
            let (_db, aggregator) = setup().await;
            assert!(aggregator.scrape_next_feed(Utc::now()).await.is_none());
            assert!(aggregator.tick().await.is_empty());
        }
    }

    mod scheduling_tests {
        use super::*;

        #[tokio::test]
        async fn test_never_fetched_feed_picked_before_recent_one() {
            let server = MockServer::start().await;
            mount_feed(&server, "/news.xml", rss_with_items(&["https://news.com/1"])).await;
            mount_feed(&server, "/blog.xml", rss_with_items(&["https://blog.com/1"])).await;

            let (db, aggregator) = setup().await;
            let news = add_feed(&db, "News", &format!("{}/news.xml", server.uri())).await;
            let blog = add_feed(&db, "Blog", &format!("{}/blog.xml", server.uri())).await;
            db.mark_feed_fetched_at(news.id, Utc::now() - ChronoDuration::hours(1))
                .await
                .unwrap();

            let reports = aggregator.tick().await;

            assert_eq!(reports.len(), 1);
            assert_eq!(reports[0].feed_id, blog.id);
            assert_eq!(reports[0].feed_name, "Blog");
        }

        #[tokio::test]
        async fn test_ticks_rotate_through_feeds() {
            let server = MockServer::start().await;
            mount_feed(&server, "/a.xml", rss_with_items(&["https://a.com/1"])).await;
            mount_feed(&server, "/b.xml", rss_with_items(&["https://b.com/1"])).await;

            let (db, aggregator) = setup().await;
            let a = add_feed(&db, "A", &format!("{}/a.xml", server.uri())).await;
            let b = add_feed(&db, "B", &format!("{}/b.xml", server.uri())).await;

            let order: Vec<i64> = [
                aggregator.tick().await[0].feed_id,
                aggregator.tick().await[0].feed_id,
                aggregator.tick().await[0].feed_id,
            ]
            .to_vec();

            assert_eq!(order, vec![a.id, b.id, a.id]);
        }

        #[tokio::test]
        async fn test_feed_is_claimed_before_fetch_completes() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string(rss_with_items(&["https://slow.com/1"]))
                        .set_delay(Duration::from_millis(500)),
                )
                .mount(&server)
                .await;

            let (db, aggregator) = setup().await;
            let feed = add_feed(&db, "Slow", &format!("{}/slow.xml", server.uri())).await;

            let cutoff = Utc::now();
            let worker = aggregator.clone();
            let handle = tokio::spawn(async move { worker.scrape_next_feed(cutoff).await });

            tokio::time::sleep(Duration::from_millis(150)).await;

            // The request is still in flight, yet the feed is already stamped
            let in_flight = db.get_feed(feed.id).await.unwrap().unwrap();
            assert!(in_flight.last_fetched_at.is_some());
            assert_eq!(db.count_posts_for_feed(feed.id).await.unwrap(), 0);
            assert!(db.claim_next_feed(cutoff).await.unwrap().is_none());

            let report = handle.await.unwrap().unwrap();
            assert_eq!(report.new_posts, 1);
        }

        #[tokio::test]
        async fn test_run_until_stops_on_shutdown() {
            let server = MockServer::start().await;
            mount_feed(&server, "/feed.xml", rss_with_items(&["https://a.com/1"])).await;

            let (db, aggregator) = setup().await;
            let feed = add_feed(&db, "Blog", &format!("{}/feed.xml", server.uri())).await;

            // First tick fires immediately; shutdown comes before the second
            aggregator
                .run_until(tokio::time::sleep(Duration::from_millis(300)))
                .await;

            assert_eq!(db.count_posts_for_feed(feed.id).await.unwrap(), 1);
        }
    }
}
