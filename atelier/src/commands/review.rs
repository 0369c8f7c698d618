use rusqlite::{params, OptionalExtension, Row, Transaction};
use tracing::info;

use crate::db::Database;
use crate::error::StoreError;
use crate::models::input::{ReviewInput, ReviewUpdateInput, ValidateExt};
use crate::models::{RatingSummary, Review};

const REVIEW_COLUMNS: &str = "id, artist_id, user_key, rating, content, created_at, updated_at";

fn review_from_row(row: &Row<'_>) -> rusqlite::Result<Review> {
    Ok(Review {
        id: row.get(0)?,
        artist_id: row.get(1)?,
        user_key: row.get(2)?,
        rating: row.get(3)?,
        content: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn load_review(
    tx: &Transaction<'_>,
    artist_id: &str,
    review_id: &str,
) -> Result<Review, StoreError> {
    tx.query_row(
        &format!(
            "SELECT {} FROM reviews WHERE id = ?1 AND artist_id = ?2",
            REVIEW_COLUMNS
        ),
        [review_id, artist_id],
        review_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::ReviewNotFound(review_id.to_string()))
}

fn add_to_ratings(tx: &Transaction<'_>, artist_id: &str, delta: i64) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO artist_ratings (artist_id, ratings) VALUES (?1, ?2)
         ON CONFLICT(artist_id) DO UPDATE SET ratings = ratings + excluded.ratings",
        params![artist_id, delta],
    )?;
    Ok(())
}

/// Store a review and add its rating to the artist's counter.
pub fn create_review(db: &Database, input: ReviewInput) -> Result<Review, StoreError> {
    input.validate_input()?;

    let (mut conn, now) = db.lock_for_write()?;
    let review = Review {
        id: uuid::Uuid::new_v4().to_string(),
        artist_id: input.artist_id,
        user_key: input.user_key,
        rating: input.rating,
        content: input.content,
        created_at: now,
        updated_at: now,
    };

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO reviews (id, artist_id, user_key, rating, content, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            &review.id,
            &review.artist_id,
            review.user_key,
            review.rating,
            &review.content,
            review.created_at,
            review.updated_at
        ],
    )?;
    add_to_ratings(&tx, &review.artist_id, review.rating)?;
    tx.commit()?;

    info!(artist_id = %review.artist_id, rating = review.rating, "Review created");
    Ok(review)
}

/// Edit a review; the counter moves by the rating delta only when it changed.
pub fn update_review(
    db: &Database,
    artist_id: &str,
    review_id: &str,
    input: ReviewUpdateInput,
) -> Result<Review, StoreError> {
    input.validate_input()?;
    let (mut conn, now) = db.lock_for_write()?;
    let tx = conn.transaction()?;

    let existing = load_review(&tx, artist_id, review_id)?;
    tx.execute(
        "UPDATE reviews SET rating = COALESCE(?2, rating), content = COALESCE(?3, content), updated_at = ?4
         WHERE id = ?1",
        params![review_id, input.rating, input.content, now],
    )?;

    if let Some(rating) = input.rating {
        let delta = rating - existing.rating;
        if delta != 0 {
            add_to_ratings(&tx, artist_id, delta)?;
        }
    }

    let updated = load_review(&tx, artist_id, review_id)?;
    tx.commit()?;
    Ok(updated)
}

/// Delete a review and take its rating back out of the counter.
pub fn delete_review(db: &Database, artist_id: &str, review_id: &str) -> Result<(), StoreError> {
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;

    let existing = load_review(&tx, artist_id, review_id)?;
    tx.execute("DELETE FROM reviews WHERE id = ?1", [review_id])?;
    if existing.rating != 0 {
        add_to_ratings(&tx, artist_id, -existing.rating)?;
    }
    tx.commit()?;

    info!(artist_id = %artist_id, review_id = %review_id, "Review deleted");
    Ok(())
}

/// Reviews of an artist, newest first
pub fn get_reviews(db: &Database, artist_id: &str) -> Result<Vec<Review>, StoreError> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM reviews WHERE artist_id = ?1 ORDER BY created_at DESC, rowid DESC",
        REVIEW_COLUMNS
    ))?;
    let reviews = stmt
        .query_map([artist_id], review_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(reviews)
}

pub fn rating_summary(db: &Database, artist_id: &str) -> Result<RatingSummary, StoreError> {
    let conn = db.lock()?;
    let ratings: i64 = conn
        .query_row(
            "SELECT ratings FROM artist_ratings WHERE artist_id = ?1",
            [artist_id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    let reviewers: i64 = conn.query_row(
        "SELECT COUNT(*) FROM reviews WHERE artist_id = ?1",
        [artist_id],
        |row| row.get(0),
    )?;

    Ok(RatingSummary { ratings, reviewers })
}
