//! Schema bootstrap.
//!
//! The tables the fetcher and the row creators touch. `bootstrap` is
//! idempotent; every statement is `create table if not exists`.

use sqlx::SqliteConnection;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    "create table if not exists messages (
        id integer primary key,
        rfc822size integer not null default 0
    )",
    "create table if not exists mailboxes (
        id integer primary key,
        name text not null unique,
        uidnext integer not null default 1,
        nextmodseq integer not null default 1
    )",
    "create table if not exists mailbox_messages (
        mailbox integer not null references mailboxes(id),
        uid integer not null,
        message integer not null references messages(id),
        idate integer not null default 0,
        modseq integer not null default 1,
        primary key (mailbox, uid)
    )",
    "create table if not exists flag_names (
        id integer primary key,
        name text not null unique collate nocase
    )",
    "create table if not exists flags (
        mailbox integer not null,
        uid integer not null,
        flag integer not null references flag_names(id),
        unique (mailbox, uid, flag)
    )",
    "create table if not exists field_names (
        id integer primary key,
        name text not null unique
    )",
    "create table if not exists header_fields (
        message integer not null references messages(id),
        part text not null default '',
        position integer not null,
        field integer not null references field_names(id),
        value text not null
    )",
    "create table if not exists addresses (
        id integer primary key,
        name text not null default '',
        localpart text not null,
        domain text not null,
        unique (name, localpart, domain)
    )",
    "create table if not exists address_fields (
        message integer not null references messages(id),
        part text not null default '',
        position integer not null,
        field integer not null,
        number integer,
        address integer not null references addresses(id)
    )",
    "create table if not exists bodyparts (
        id integer primary key,
        bytes integer not null default 0,
        nlines integer,
        text text,
        data blob
    )",
    "create table if not exists part_numbers (
        message integer not null references messages(id),
        part text not null,
        bodypart integer references bodyparts(id),
        bytes integer,
        nlines integer
    )",
    "create table if not exists annotation_names (
        id integer primary key,
        name text not null unique
    )",
    "create table if not exists annotations (
        mailbox integer not null,
        uid integer not null,
        owner integer,
        name integer not null references annotation_names(id),
        value text not null,
        unique (mailbox, uid, owner, name)
    )",
];

/// Creates every table the store uses, if missing.
///
/// # Errors
///
/// Returns an error if a statement fails.
pub async fn bootstrap(conn: &mut SqliteConnection) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(&mut *conn).await?;
    }
    Ok(())
}
