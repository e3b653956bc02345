use futures::TryStreamExt;
use wbstat_http::{ClientOptions, ReportQuery, RetryPolicy, StatClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let client = StatClient::from_env()
        .map_err(anyhow::Error::msg)?
        .with_options(ClientOptions {
            max_concurrent: 4,
            retry: RetryPolicy::default().on_retry(|attempt, delay, err| {
                eprintln!("retry #{attempt} in {delay:?}: {err}");
            }),
            ..ClientOptions::default()
        });

    println!("ping: {}", client.ping().await?);

    let query = ReportQuery::new("2024-01-01", "2024-01-31")
        .fetch_all(true)
        .transform(|mut row| {
            row.retain(|key, _| matches!(key.as_str(), "rrd_id" | "nm_id" | "retail_amount"));
            row
        });

    let mut rows = client.stream_report_detail_by_period(query);
    let mut total = 0usize;
    while let Some(row) = rows.try_next().await? {
        total += 1;
        if total <= 5 {
            println!("{row:?}");
        }
    }
    println!("{total} rows");

    Ok(())
}
