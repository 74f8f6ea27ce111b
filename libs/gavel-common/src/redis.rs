use crate::types::SubmissionRecord;
use redis::{AsyncCommands, RedisResult};
use uuid::Uuid;

/// Redis persistence semantics - key layout and atomic record operations.
/// Every submission is one JSON value; each update replaces it whole, so a
/// reader never observes a status without the results written with it.

pub const SUBMISSION_PREFIX: &str = "gavel:submission";
pub const OWNER_PREFIX: &str = "gavel:owner";
/// Every live submission id, for listings that span all owners
pub const ALL_SUBMISSIONS_KEY: &str = "gavel:submissions";

/// Replace a record only if the stored revision still matches ARGV[1].
const SWAP_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return 0
end
local decoded = cjson.decode(current)
if tonumber(decoded['revision']) ~= tonumber(ARGV[1]) then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
return 1
"#;

/// Generate the record key for a submission
pub fn submission_key(id: &Uuid) -> String {
    format!("{}:{}", SUBMISSION_PREFIX, id)
}

/// Generate the owner index key
pub fn owner_key(owner: &str) -> String {
    format!("{}:{}", OWNER_PREFIX, owner)
}

fn to_payload(record: &SubmissionRecord) -> RedisResult<String> {
    serde_json::to_string(record).map_err(|e| {
        redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "serialization error",
            e.to_string(),
        ))
    })
}

/// Store a new record. Returns false if the id already exists.
pub async fn insert_record(
    conn: &mut redis::aio::ConnectionManager,
    record: &SubmissionRecord,
    ttl_secs: u64,
) -> RedisResult<bool> {
    let key = submission_key(&record.id);
    let payload = to_payload(record)?;

    let reply: Option<String> = redis::cmd("SET")
        .arg(&key)
        .arg(payload)
        .arg("NX")
        .arg("EX")
        .arg(ttl_secs)
        .query_async(conn)
        .await?;

    if reply.is_none() {
        return Ok(false);
    }

    let _: () = conn.sadd(ALL_SUBMISSIONS_KEY, record.id.to_string()).await?;
    let _: () = conn.expire(ALL_SUBMISSIONS_KEY, ttl_secs as i64).await?;

    if let Some(owner) = &record.owner {
        let owner_key_str = owner_key(owner);
        let _: () = conn.sadd(&owner_key_str, record.id.to_string()).await?;
        let _: () = conn.expire(&owner_key_str, ttl_secs as i64).await?;
    }

    Ok(true)
}

/// Retrieve a record
pub async fn load_record(
    conn: &mut redis::aio::ConnectionManager,
    id: &Uuid,
) -> RedisResult<Option<SubmissionRecord>> {
    let key = submission_key(id);
    let payload: Option<String> = conn.get(&key).await?;

    match payload {
        Some(data) => {
            let record: SubmissionRecord = serde_json::from_str(&data).map_err(|e| {
                redis::RedisError::from((
                    redis::ErrorKind::TypeError,
                    "deserialization error",
                    e.to_string(),
                ))
            })?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

/// Atomically replace a record whose stored revision equals `expected_revision`
pub async fn swap_record(
    conn: &mut redis::aio::ConnectionManager,
    expected_revision: u64,
    record: &SubmissionRecord,
    ttl_secs: u64,
) -> RedisResult<bool> {
    let payload = to_payload(record)?;
    let swapped: i32 = redis::Script::new(SWAP_SCRIPT)
        .key(submission_key(&record.id))
        .arg(expected_revision)
        .arg(payload)
        .arg(ttl_secs)
        .invoke_async(conn)
        .await?;
    Ok(swapped == 1)
}

/// Submission ids recorded for an owner, or for everyone when `owner` is None
pub async fn submission_ids(
    conn: &mut redis::aio::ConnectionManager,
    owner: Option<&str>,
) -> RedisResult<Vec<Uuid>> {
    let key = match owner {
        Some(owner) => owner_key(owner),
        None => ALL_SUBMISSIONS_KEY.to_string(),
    };
    let members: Vec<String> = conn.smembers(key).await?;
    Ok(members
        .iter()
        .filter_map(|m| Uuid::parse_str(m).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_key_deterministic() {
        let id = Uuid::new_v4();
        let key1 = submission_key(&id);
        let key2 = submission_key(&id);
        assert_eq!(key1, key2);
        assert!(key1.starts_with("gavel:submission:"));
        assert!(key1.contains(&id.to_string()));
    }

    #[test]
    fn test_owner_key_format() {
        assert_eq!(owner_key("student-7"), "gavel:owner:student-7");
    }
}
