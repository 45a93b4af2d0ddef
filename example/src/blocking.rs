use pgpoll::{Connection, Encode, Format, ResultStatus, Result};

pub fn main() -> Result<()> {
    // reads `DATABASE_URL` and `PG*` environment variables
    let mut conn = Connection::connect_env()?;

    conn.exec("CREATE TEMP TABLE post(id serial, name text)")?;

    let result = conn.exec_params(
        "INSERT INTO post(name) VALUES($1), ($2)",
        &["Deez".encode(), "Foo".encode()],
        Format::Text,
    )?;
    assert_eq!(result.cmd_tuples(), 2);

    let result = conn.exec("SELECT id, name FROM post ORDER BY id")?;
    let answer = result.answer()?;
    assert_eq!(answer.len(), 2);
    for row in answer.rows() {
        let (id, name): (i32, &str) = row.decode()?;
        tracing::info!(id, name);
    }
    println!("{answer}");

    // prepared statement
    conn.prepare("by_name", "SELECT id FROM post WHERE name = $1", &[])?;
    let desc = conn.describe_prepared("by_name")?;
    assert_eq!(desc.answer()?.n_params(), 1);

    let result = conn.exec_prepared("by_name", &["Foo".encode()], Format::Binary)?;
    assert_eq!(result.answer()?.get::<i32>(0, 0)?, 2);

    // server error keeps the connection usable
    let result = conn.exec("SELECT foo")?;
    assert_eq!(result.status(), ResultStatus::FatalError);
    assert_eq!(result.error().map(|e| e.code()), Some("42703"));

    let name = conn.escape_literal("it's")?;
    let result = conn.exec(&format!("SELECT {name}"))?;
    assert_eq!(result.answer()?.get::<&str>(0, 0)?, "it's");

    conn.close();
    Ok(())
}
