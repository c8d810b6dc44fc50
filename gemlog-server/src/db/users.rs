use anyhow::Context;
use gemlog_api::{
    Profile, ProfileUpdate, RegisteredUser, SearchHit, Time, UserId, UserSummary, Uuid,
    SEARCH_RESULTS_LIMIT,
};
use sqlx::{Connection, FromRow, Row};

use super::{is_unique_violation, UserRow, USER_COLUMNS};
use crate::{query::like_pattern, Error};

pub async fn create_user(
    conn: &mut sqlx::PgConnection,
    email: &str,
    username: &str,
    password_hash: &str,
) -> Result<RegisteredUser, Error> {
    let existing = sqlx::query(
        "
            SELECT email FROM users
            WHERE email = $1 OR username = $2
            ORDER BY (email = $1) DESC
            LIMIT 1
        ",
    )
    .bind(email)
    .bind(username)
    .fetch_optional(&mut *conn)
    .await
    .context("checking for users with the same email or username")?;
    if let Some(row) = existing {
        let existing_email: String = row.try_get("email").context("retrieving email field")?;
        return Err(Error::conflict(match existing_email == email {
            true => "Email already exists",
            false => "Username already exists",
        }));
    }

    let id = Uuid::new_v4();
    let res = sqlx::query(
        "INSERT INTO users (id, email, username, password_hash) VALUES ($1, $2, $3, $4)",
    )
    .bind(id)
    .bind(email)
    .bind(username)
    .bind(password_hash)
    .execute(&mut *conn)
    .await;
    match res {
        Ok(_) => Ok(RegisteredUser {
            id: UserId(id),
            email: String::from(email),
            username: String::from(username),
        }),
        Err(e) if is_unique_violation(&e) => {
            Err(Error::conflict("Email or username already exists"))
        }
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("inserting user {:?}", username))
            .into()),
    }
}

/// Looks a user up by email, returning its public fields and password hash
pub async fn fetch_credentials(
    conn: &mut sqlx::PgConnection,
    email: &str,
) -> anyhow::Result<Option<(UserSummary, String)>> {
    let row = sqlx::query(&format!(
        "SELECT {USER_COLUMNS}, u.password_hash FROM users u WHERE u.email = $1"
    ))
    .bind(email)
    .fetch_optional(&mut *conn)
    .await
    .context("querying users table")?;
    match row {
        None => Ok(None),
        Some(row) => {
            let hash: String = row
                .try_get("password_hash")
                .context("retrieving password_hash field")?;
            let user = UserRow::from_row(&row)
                .context("retrieving user fields")?;
            Ok(Some((user.into(), hash)))
        }
    }
}

pub async fn followers_of(
    conn: &mut sqlx::PgConnection,
    user: UserId,
) -> anyhow::Result<Vec<UserSummary>> {
    Ok(sqlx::query_as::<_, UserRow>(&format!(
        "
            SELECT {USER_COLUMNS}
                FROM follows f
            INNER JOIN users u
                ON u.id = f.follower_id
            WHERE f.followee_id = $1
            ORDER BY f.seq
        "
    ))
    .bind(user.0)
    .fetch_all(&mut *conn)
    .await
    .with_context(|| format!("fetching followers of {:?}", user))?
    .into_iter()
    .map(UserSummary::from)
    .collect())
}

pub async fn following_of(
    conn: &mut sqlx::PgConnection,
    user: UserId,
) -> anyhow::Result<Vec<UserSummary>> {
    Ok(sqlx::query_as::<_, UserRow>(&format!(
        "
            SELECT {USER_COLUMNS}
                FROM follows f
            INNER JOIN users u
                ON u.id = f.followee_id
            WHERE f.follower_id = $1
            ORDER BY f.seq
        "
    ))
    .bind(user.0)
    .fetch_all(&mut *conn)
    .await
    .with_context(|| format!("fetching users followed by {:?}", user))?
    .into_iter()
    .map(UserSummary::from)
    .collect())
}

pub async fn fetch_profile(conn: &mut sqlx::PgConnection, user: UserId) -> Result<Profile, Error> {
    let row = sqlx::query(&format!(
        "SELECT {USER_COLUMNS}, u.created_at, u.updated_at FROM users u WHERE u.id = $1"
    ))
    .bind(user.0)
    .fetch_optional(&mut *conn)
    .await
    .with_context(|| format!("fetching profile of {:?}", user))?
    .ok_or_else(Error::user_not_found)?;
    let created_at: Time = row
        .try_get("created_at")
        .context("retrieving created_at field")?;
    let updated_at: Time = row
        .try_get("updated_at")
        .context("retrieving updated_at field")?;
    let summary = UserRow::from_row(&row).context("retrieving user fields")?;
    Ok(Profile {
        user: summary.into(),
        followers: followers_of(&mut *conn, user).await?,
        following: following_of(&mut *conn, user).await?,
        created_at,
        updated_at,
    })
}

pub async fn user_exists(conn: &mut sqlx::PgConnection, user: UserId) -> anyhow::Result<bool> {
    Ok(sqlx::query("SELECT 1 FROM users WHERE id = $1")
        .bind(user.0)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("checking existence of {:?}", user))?
        .is_some())
}

async fn is_taken(
    conn: &mut sqlx::PgConnection,
    column: &'static str,
    value: &str,
) -> anyhow::Result<bool> {
    Ok(
        sqlx::query(&format!("SELECT 1 FROM users WHERE {column} = $1"))
            .bind(value)
            .fetch_optional(&mut *conn)
            .await
            .with_context(|| format!("checking whether {column} is taken"))?
            .is_some(),
    )
}

pub async fn update_profile(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    update: &ProfileUpdate,
) -> Result<UserSummary, Error> {
    let mut tx = conn.begin().await.context("starting transaction")?;
    let mut current: UserSummary = sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM users u WHERE u.id = $1 FOR UPDATE"
    ))
    .bind(user.0)
    .fetch_optional(&mut *tx)
    .await
    .with_context(|| format!("locking user {:?}", user))?
    .ok_or_else(Error::user_not_found)?
    .into();

    let mut changed = false;
    if let Some(username) = update.username() {
        if username != current.username {
            if is_taken(&mut *tx, "username", username).await? {
                return Err(Error::conflict("Username already exists"));
            }
            current.username = String::from(username);
            changed = true;
        }
    }
    if let Some(email) = update.email() {
        if email != current.email {
            if is_taken(&mut *tx, "email", email).await? {
                return Err(Error::conflict("Email already exists"));
            }
            current.email = String::from(email);
            changed = true;
        }
    }

    if changed {
        let res = sqlx::query(
            "UPDATE users SET username = $2, email = $3, updated_at = now() WHERE id = $1",
        )
        .bind(user.0)
        .bind(&current.username)
        .bind(&current.email)
        .execute(&mut *tx)
        .await;
        match res {
            Ok(_) => (),
            Err(e) if is_unique_violation(&e) => {
                return Err(Error::conflict("Email or username already exists"))
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("updating profile of {:?}", user))
                    .into())
            }
        }
    }
    tx.commit().await.context("committing profile update")?;
    Ok(current)
}

/// Sets the profile picture, returning the previous one
pub async fn set_profile_picture(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    picture: &str,
) -> Result<Option<String>, Error> {
    let mut tx = conn.begin().await.context("starting transaction")?;
    let previous = lock_profile_picture(&mut *tx, user).await?;
    sqlx::query("UPDATE users SET profile_picture = $2, updated_at = now() WHERE id = $1")
        .bind(user.0)
        .bind(picture)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("setting profile picture of {:?}", user))?;
    tx.commit()
        .await
        .context("committing profile picture change")?;
    Ok(previous)
}

/// Clears the profile picture, returning the removed one
pub async fn take_profile_picture(
    conn: &mut sqlx::PgConnection,
    user: UserId,
) -> Result<String, Error> {
    let mut tx = conn.begin().await.context("starting transaction")?;
    let previous = lock_profile_picture(&mut *tx, user)
        .await?
        .ok_or_else(|| Error::validation("No profile picture to delete"))?;
    sqlx::query("UPDATE users SET profile_picture = NULL, updated_at = now() WHERE id = $1")
        .bind(user.0)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("clearing profile picture of {:?}", user))?;
    tx.commit()
        .await
        .context("committing profile picture removal")?;
    Ok(previous)
}

async fn lock_profile_picture(
    conn: &mut sqlx::PgConnection,
    user: UserId,
) -> Result<Option<String>, Error> {
    Ok(
        sqlx::query("SELECT profile_picture FROM users WHERE id = $1 FOR UPDATE")
            .bind(user.0)
            .fetch_optional(&mut *conn)
            .await
            .with_context(|| format!("locking user {:?}", user))?
            .ok_or_else(Error::user_not_found)?
            .try_get("profile_picture")
            .context("retrieving profile_picture field")?,
    )
}

pub async fn follow(
    conn: &mut sqlx::PgConnection,
    follower: UserId,
    followee: UserId,
) -> Result<(), Error> {
    if follower == followee {
        return Err(Error::validation("You cannot follow yourself"));
    }
    if !user_exists(&mut *conn, followee).await? {
        return Err(Error::user_not_found());
    }
    let res = sqlx::query(
        "
            INSERT INTO follows (follower_id, followee_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
        ",
    )
    .bind(follower.0)
    .bind(followee.0)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("recording that {:?} follows {:?}", follower, followee))?;
    match res.rows_affected() {
        0 => Err(Error::conflict("Already following this user")),
        _ => Ok(()),
    }
}

pub async fn unfollow(
    conn: &mut sqlx::PgConnection,
    follower: UserId,
    followee: UserId,
) -> Result<(), Error> {
    if follower == followee {
        return Err(Error::validation("You cannot unfollow yourself"));
    }
    if !user_exists(&mut *conn, followee).await? {
        return Err(Error::user_not_found());
    }
    let res = sqlx::query("DELETE FROM follows WHERE follower_id = $1 AND followee_id = $2")
        .bind(follower.0)
        .bind(followee.0)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("removing follow of {:?} by {:?}", followee, follower))?;
    match res.rows_affected() {
        0 => Err(Error::conflict("Not following this user")),
        _ => Ok(()),
    }
}

pub async fn search_users(
    conn: &mut sqlx::PgConnection,
    searcher: UserId,
    needle: &str,
) -> anyhow::Result<Vec<SearchHit>> {
    let rows = sqlx::query(&format!(
        "
            SELECT
                {USER_COLUMNS},
                EXISTS(
                    SELECT 1 FROM follows f
                    WHERE f.follower_id = $2 AND f.followee_id = u.id
                ) AS is_following
            FROM users u
            WHERE u.username ILIKE $1 ESCAPE '\\'
            AND u.id <> $2
            ORDER BY u.seq
            LIMIT $3
        "
    ))
    .bind(like_pattern(needle))
    .bind(searcher.0)
    .bind(SEARCH_RESULTS_LIMIT)
    .fetch_all(&mut *conn)
    .await
    .with_context(|| format!("searching users matching {:?}", needle))?;
    rows.into_iter()
        .map(|row| {
            Ok(SearchHit {
                is_following: row
                    .try_get("is_following")
                    .context("retrieving is_following field")?,
                user: UserRow::from_row(&row)
                    .context("retrieving user fields")?
                    .into(),
            })
        })
        .collect()
}
